// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The `#[test]` attribute re-exported by `test_with_tracing`.

use quote::quote;
use syn::parse_macro_input;
use syn::spanned::Spanned;
use syn::Error;
use syn::ItemFn;

/// Like `#[test]`, but installs the tracing test subscriber before running the
/// body.
///
/// Other attributes on the function (`#[should_panic]`, `#[ignore]`, cfgs) are
/// carried over to the generated test.
#[proc_macro_attribute]
pub fn test(
    attr: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let attr = proc_macro2::TokenStream::from(attr);
    let item = parse_macro_input!(item as ItemFn);
    expand(attr, item)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

fn expand(attr: proc_macro2::TokenStream, item: ItemFn) -> syn::Result<proc_macro2::TokenStream> {
    if !attr.is_empty() {
        return Err(Error::new(attr.span(), "unexpected arguments"));
    }
    let sig = &item.sig;
    if let Some(asyncness) = &sig.asyncness {
        return Err(Error::new(asyncness.span(), "async tests are not supported"));
    }
    if !sig.generics.params.is_empty() {
        return Err(Error::new(sig.generics.span(), "tests cannot be generic"));
    }
    if !sig.inputs.is_empty() {
        return Err(Error::new(sig.inputs.span(), "tests take no arguments"));
    }

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = item;
    let name = &sig.ident;
    let output = &sig.output;

    Ok(quote! {
        #[::core::prelude::v1::test]
        #(#attrs)*
        #vis fn #name() #output {
            ::test_with_tracing::init();
            let body = move || #output #block;
            body()
        }
    })
}
