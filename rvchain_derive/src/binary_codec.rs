//! `#[derive(BinaryCodec)]` implementation.
//!
//! Generates `Encode` and `Decode` impls for structs (named, tuple, unit) and
//! enums. Enum variants are encoded as a `u8` discriminant followed by the
//! variant's fields; explicit discriminants (`Variant = 5`) are respected.
//! The format is deterministic: fields in declaration order, integers
//! little-endian, no padding.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DataEnum, DeriveInput, Fields};

pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let expanded = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => {
                let names: Vec<_> = fields.named.iter().map(|f| &f.ident).collect();
                let encode = names.iter().map(|n| {
                    quote! { crate::types::encoding::Encode::encode(&self.#n, out); }
                });
                let decode = names.iter().map(|n| {
                    quote! { #n: crate::types::encoding::Decode::decode(input)?, }
                });
                impl_pair(
                    name,
                    &impl_generics,
                    &ty_generics,
                    where_clause,
                    quote! { #(#encode)* },
                    quote! { Ok(Self { #(#decode)* }) },
                )
            }
            Fields::Unnamed(fields) => {
                let indices: Vec<_> = (0..fields.unnamed.len()).map(syn::Index::from).collect();
                let encode = indices.iter().map(|i| {
                    quote! { crate::types::encoding::Encode::encode(&self.#i, out); }
                });
                let decode = indices.iter().map(|_| {
                    quote! { crate::types::encoding::Decode::decode(input)?, }
                });
                impl_pair(
                    name,
                    &impl_generics,
                    &ty_generics,
                    where_clause,
                    quote! { #(#encode)* },
                    quote! { Ok(Self( #(#decode)* )) },
                )
            }
            Fields::Unit => impl_pair(
                name,
                &impl_generics,
                &ty_generics,
                where_clause,
                quote! {},
                quote! { Ok(Self) },
            ),
        },
        Data::Enum(data) => enum_impl(name, &impl_generics, &ty_generics, where_clause, data),
        Data::Union(_) => {
            syn::Error::new_spanned(&input, "BinaryCodec derive does not support unions")
                .to_compile_error()
        }
    };

    TokenStream::from(expanded)
}

fn impl_pair(
    name: &syn::Ident,
    impl_generics: &syn::ImplGenerics,
    ty_generics: &syn::TypeGenerics,
    where_clause: Option<&syn::WhereClause>,
    encode_body: proc_macro2::TokenStream,
    decode_body: proc_macro2::TokenStream,
) -> proc_macro2::TokenStream {
    quote! {
        impl #impl_generics crate::types::encoding::Encode for #name #ty_generics #where_clause {
            fn encode<S: crate::types::encoding::EncodeSink>(&self, out: &mut S) {
                let _ = &out;
                #encode_body
            }
        }

        impl #impl_generics crate::types::encoding::Decode for #name #ty_generics #where_clause {
            fn decode(input: &mut &[u8]) -> ::std::result::Result<Self, crate::types::encoding::DecodeError> {
                let _ = &input;
                #decode_body
            }
        }
    }
}

fn enum_impl(
    name: &syn::Ident,
    impl_generics: &syn::ImplGenerics,
    ty_generics: &syn::TypeGenerics,
    where_clause: Option<&syn::WhereClause>,
    data: &DataEnum,
) -> proc_macro2::TokenStream {
    let discriminants = discriminants(data);

    let encode_arms = data
        .variants
        .iter()
        .zip(discriminants.iter())
        .map(|(variant, &tag)| {
            let vname = &variant.ident;
            match &variant.fields {
                Fields::Unit => quote! {
                    Self::#vname => {
                        crate::types::encoding::Encode::encode(&#tag, out);
                    }
                },
                Fields::Unnamed(fields) => {
                    let bindings: Vec<_> = (0..fields.unnamed.len())
                        .map(|i| quote::format_ident!("f{}", i))
                        .collect();
                    let writes = bindings.iter().map(|b| {
                        quote! { crate::types::encoding::Encode::encode(#b, out); }
                    });
                    quote! {
                        Self::#vname(#(#bindings),*) => {
                            crate::types::encoding::Encode::encode(&#tag, out);
                            #(#writes)*
                        }
                    }
                }
                Fields::Named(fields) => {
                    let bindings: Vec<_> = fields.named.iter().map(|f| &f.ident).collect();
                    let writes = bindings.iter().map(|b| {
                        quote! { crate::types::encoding::Encode::encode(#b, out); }
                    });
                    quote! {
                        Self::#vname { #(#bindings),* } => {
                            crate::types::encoding::Encode::encode(&#tag, out);
                            #(#writes)*
                        }
                    }
                }
            }
        });

    let decode_arms = data
        .variants
        .iter()
        .zip(discriminants.iter())
        .map(|(variant, &tag)| {
            let vname = &variant.ident;
            match &variant.fields {
                Fields::Unit => quote! { #tag => Ok(Self::#vname), },
                Fields::Unnamed(fields) => {
                    let reads = (0..fields.unnamed.len()).map(|_| {
                        quote! { crate::types::encoding::Decode::decode(input)?, }
                    });
                    quote! { #tag => Ok(Self::#vname(#(#reads)*)), }
                }
                Fields::Named(fields) => {
                    let reads = fields.named.iter().map(|f| {
                        let fname = &f.ident;
                        quote! { #fname: crate::types::encoding::Decode::decode(input)?, }
                    });
                    quote! { #tag => Ok(Self::#vname { #(#reads)* }), }
                }
            }
        });

    quote! {
        impl #impl_generics crate::types::encoding::Encode for #name #ty_generics #where_clause {
            fn encode<S: crate::types::encoding::EncodeSink>(&self, out: &mut S) {
                match self {
                    #(#encode_arms)*
                }
            }
        }

        impl #impl_generics crate::types::encoding::Decode for #name #ty_generics #where_clause {
            fn decode(input: &mut &[u8]) -> ::std::result::Result<Self, crate::types::encoding::DecodeError> {
                let tag: u8 = crate::types::encoding::Decode::decode(input)?;
                match tag {
                    #(#decode_arms)*
                    _ => Err(crate::types::encoding::DecodeError::InvalidValue),
                }
            }
        }
    }
}

/// Computes the `u8` wire tag of each variant, following Rust's discriminant
/// rules: explicit values are honored, everything else increments from the
/// previous variant.
fn discriminants(data: &DataEnum) -> Vec<u8> {
    let mut tags = Vec::with_capacity(data.variants.len());
    let mut next: u8 = 0;

    for variant in &data.variants {
        let tag = match &variant.discriminant {
            Some((_, expr)) => parse_discriminant(expr),
            None => next,
        };
        tags.push(tag);
        next = tag.wrapping_add(1);
    }

    tags
}

fn parse_discriminant(expr: &syn::Expr) -> u8 {
    match expr {
        syn::Expr::Lit(lit) => match &lit.lit {
            syn::Lit::Int(int) => int
                .base10_parse::<u8>()
                .expect("enum discriminant must fit in u8"),
            _ => panic!("enum discriminant must be an integer literal"),
        },
        _ => panic!("enum discriminant must be an integer literal"),
    }
}
