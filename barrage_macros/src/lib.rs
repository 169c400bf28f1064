use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Fields, ItemEnum, LitFloat};

extern crate proc_macro;

/// Turn a unit-only enum into a `Weighted` type.
///
/// Every variant needs a `#[weight(x)]` attribute; the weights are checked to sum
/// to 1.0 when the `WeightedTable` is built. The enum also gets `Debug`, `Clone`,
/// `Copy`, `PartialEq` and `Eq`, and `Weighted` must be in scope at the call site.
///
/// ```rust,ignore
/// #[weighted]
/// enum Endpoint {
///     #[weight(0.8)]
///     Read,
///     #[weight(0.2)]
///     Write,
/// }
/// ```
#[proc_macro_attribute]
pub fn weighted(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut ast = parse_macro_input!(item as ItemEnum);
    let ident = &ast.ident;

    let mut entries = Vec::with_capacity(ast.variants.len());
    for variant in ast.variants.iter_mut() {
        if !matches!(variant.fields, Fields::Unit) {
            return syn::Error::new_spanned(&variant.fields, "weighted variants cannot carry data")
                .to_compile_error()
                .into();
        }

        let position = variant.attrs.iter().position(|a| a.path().is_ident("weight"));
        let Some(position) = position else {
            return syn::Error::new_spanned(&variant.ident, "missing #[weight(..)] attribute")
                .to_compile_error()
                .into();
        };
        // the helper attribute is not registered anywhere, strip it before re-emitting
        let attr = variant.attrs.remove(position);
        let weight: LitFloat = match attr.parse_args() {
            Ok(w) => w,
            Err(e) => return e.to_compile_error().into(),
        };

        let name = &variant.ident;
        entries.push(quote! { (#ident::#name, #weight) });
    }

    let expanded = quote! {
        #[derive(
            std::fmt::Debug,
            std::clone::Clone,
            std::marker::Copy,
            std::cmp::PartialEq,
            std::cmp::Eq
        )]
        #ast

        impl Weighted for #ident {
            fn weights() -> std::vec::Vec<(Self, f64)> {
                std::vec![#(#entries),*]
            }
        }
    };

    TokenStream::from(expanded)
}
