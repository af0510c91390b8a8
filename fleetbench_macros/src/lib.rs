use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{DeriveInput, parse_macro_input};

extern crate proc_macro;

fn wire_derives(ast: &DeriveInput, extra: TokenStream2) -> TokenStream {
    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialEq,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #extra
        #ast
    };

    TokenStream::from(expanded)
}

/// Marks a type that travels between main and workers.
///
/// Derives `Serialize`, `Deserialize`, `PartialEq`, `Debug` and `Clone`.
#[proc_macro_attribute]
pub fn message(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as DeriveInput);
    wire_derives(&ast, quote! {})
}

/// Marks a stage configuration.
///
/// Same derives as [`message`], and unknown configuration keys are rejected
/// while deserializing so typos surface before anything is dispatched.
#[proc_macro_attribute]
pub fn stage(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as DeriveInput);
    wire_derives(&ast, quote! { #[serde(deny_unknown_fields)] })
}
