//! # Accessor Derive
//!
//! Builder-style setters for the configuration input model, so board
//! definitions can be assembled in code as fluently as they read in JSON.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{
    Data, DeriveInput, Fields, GenericArgument, LitBool, PathArguments, Type, parse_macro_input,
    spanned::Spanned,
};

/// Derive to generate `.with_<field>(self, value) -> Self` and
/// `.set_<field>(&mut self, value) -> &mut Self` for each **named** field.
///
/// Field options, combinable inside one `#[setters(...)]`:
///
/// - `skip`: generate nothing for the field.
/// - `into`: accept `impl Into<Ty>`.
/// - `strip_option`: for an `Option<T>` field, accept `T` and store `Some`.
///
/// # Example
///
/// ```
/// use utils_accessors_derive::Setters;
///
/// #[derive(Default, Setters)]
/// struct Region {
///     #[setters(strip_option)]
///     phys_start: Option<u64>,
///     size: u64,
///     #[setters(into)]
///     comment: String,
///     #[setters(skip)]
///     _index: usize,
/// }
///
/// let r = Region::default()
///     .with_phys_start(0x1fc0_0000)
///     .with_size(0x1_0000)
///     .with_comment("state table");
/// assert_eq!(r.phys_start, Some(0x1fc0_0000));
/// assert_eq!(r.comment, "state table");
/// ```
#[proc_macro_derive(Setters, attributes(setters))]
pub fn derive_generate_setters(input: TokenStream) -> TokenStream {
    let DeriveInput {
        ident,
        generics,
        data,
        ..
    } = parse_macro_input!(input as DeriveInput);

    let fields = match data {
        Data::Struct(s) => match s.fields {
            Fields::Named(n) => n.named,
            Fields::Unnamed(u) => {
                return syn::Error::new(u.span(), "Setters only supports named fields")
                    .to_compile_error()
                    .into();
            }
            Fields::Unit => {
                return syn::Error::new(ident.span(), "Setters does not apply to unit structs")
                    .to_compile_error()
                    .into();
            }
        },
        _ => {
            return syn::Error::new(ident.span(), "Setters can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let mut methods = Vec::new();

    for field in fields {
        let Some(fname) = &field.ident else { continue };
        let opts = match FieldOptions::parse(&field.attrs) {
            Ok(opts) => opts,
            Err(e) => return e.to_compile_error().into(),
        };
        if opts.skip {
            continue;
        }

        let ty = &field.ty;
        let set_name = format_ident!("set_{}", fname);
        let with_name = format_ident!("with_{}", fname);

        let (arg_ty, store) = if opts.strip_option {
            let Some(inner) = option_inner(ty) else {
                return syn::Error::new(ty.span(), "strip_option requires an Option<T> field")
                    .to_compile_error()
                    .into();
            };
            if opts.into {
                (
                    quote! { impl ::core::convert::Into<#inner> },
                    quote! { ::core::option::Option::Some(value.into()) },
                )
            } else {
                (quote! { #inner }, quote! { ::core::option::Option::Some(value) })
            }
        } else if opts.into {
            (
                quote! { impl ::core::convert::Into<#ty> },
                quote! { value.into() },
            )
        } else {
            (quote! { #ty }, quote! { value })
        };

        methods.push(quote! {
            #[inline]
            #[must_use]
            pub fn #with_name(mut self, value: #arg_ty) -> Self {
                self.#fname = #store;
                self
            }

            #[inline]
            pub fn #set_name(&mut self, value: #arg_ty) -> &mut Self {
                self.#fname = #store;
                self
            }
        });
    }

    let expanded = quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    };

    TokenStream::from(expanded)
}

#[derive(Default)]
struct FieldOptions {
    skip: bool,
    into: bool,
    strip_option: bool,
}

impl FieldOptions {
    fn parse(attrs: &[syn::Attribute]) -> syn::Result<Self> {
        let mut opts = Self::default();
        for attr in attrs {
            if !attr.path().is_ident("setters") {
                continue;
            }

            // Accept #[setters(skip)] as well as #[setters(skip = true)]
            attr.parse_nested_meta(|meta| {
                let flag = if meta.input.is_empty() || meta.input.peek(syn::Token![,]) {
                    true
                } else {
                    meta.value()?.parse::<LitBool>()?.value
                };

                if meta.path.is_ident("skip") {
                    opts.skip = flag;
                } else if meta.path.is_ident("into") {
                    opts.into = flag;
                } else if meta.path.is_ident("strip_option") {
                    opts.strip_option = flag;
                } else {
                    return Err(meta.error("expected `skip`, `into` or `strip_option`"));
                }
                Ok(())
            })?;
        }
        Ok(opts)
    }
}

/// `T` for a field declared as `Option<T>`.
fn option_inner(ty: &Type) -> Option<&Type> {
    let Type::Path(path) = ty else { return None };
    let last = path.path.segments.last()?;
    if last.ident != "Option" {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &last.arguments else {
        return None;
    };
    match args.args.first()? {
        GenericArgument::Type(inner) => Some(inner),
        _ => None,
    }
}
