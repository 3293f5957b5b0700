//! `#[derive(Error)]` implementation.
//!
//! Generates `Display` and `std::error::Error` from `#[error("...")]`
//! attributes. Positional placeholders (`{0}`) work for tuple variants and
//! named placeholders (`{field}`) for struct variants.

use proc_macro::TokenStream;
use quote::{quote, ToTokens};
use syn::{parse_macro_input, Data, DeriveInput, Fields, Lit, Meta};

pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let data = match &input.data {
        Data::Enum(data) => data,
        _ => {
            return Err(syn::Error::new_spanned(
                input,
                "Error derive only supports enums",
            ));
        }
    };

    let display_arms = data
        .variants
        .iter()
        .map(|variant| {
            let vname = &variant.ident;
            let message = error_message(&variant.attrs, variant)?;

            Ok(match &variant.fields {
                Fields::Unit => quote! {
                    Self::#vname => write!(f, #message),
                },
                Fields::Unnamed(fields) => {
                    let bindings: Vec<_> = (0..fields.unnamed.len())
                        .map(|i| quote::format_ident!("f{}", i))
                        .collect();
                    let message = positional_to_named(&message, fields.unnamed.len());
                    quote! {
                        Self::#vname(#(#bindings),*) =>
                            write!(f, #message, #(#bindings = #bindings),*),
                    }
                }
                Fields::Named(fields) => {
                    let bindings: Vec<_> = fields.named.iter().map(|f| &f.ident).collect();
                    quote! {
                        Self::#vname { #(#bindings),* } =>
                            write!(f, #message, #(#bindings = #bindings),*),
                    }
                }
            })
        })
        .collect::<syn::Result<Vec<_>>>()?;

    Ok(quote! {
        impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                match self {
                    #(#display_arms)*
                }
            }
        }

        impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {}
    })
}

/// Pulls the string literal out of `#[error("...")]`.
fn error_message<T: ToTokens>(attrs: &[syn::Attribute], target: &T) -> syn::Result<String> {
    for attr in attrs {
        if !attr.path().is_ident("error") {
            continue;
        }
        if let Meta::List(list) = &attr.meta {
            if let Ok(Lit::Str(lit)) = syn::parse2::<Lit>(list.tokens.clone()) {
                return Ok(lit.value());
            }
        }
        return Err(syn::Error::new_spanned(
            &attr.meta,
            "expected #[error(\"message\")] with a string literal",
        ));
    }

    Err(syn::Error::new_spanned(
        target,
        "missing #[error(\"...\")] attribute; every variant must declare a display message",
    ))
}

/// Rewrites `{0}`, `{1}` ... to the binding names `{f0}`, `{f1}` ... so the
/// generated `write!` can use named arguments throughout.
fn positional_to_named(message: &str, field_count: usize) -> String {
    let mut out = message.to_string();
    for i in (0..field_count).rev() {
        out = out.replace(&format!("{{{}}}", i), &format!("{{f{}}}", i));
    }
    out
}
