use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{quote, ToTokens};
use syn::{
    parse_macro_input, Attribute, Data, DeriveInput, Fields, LitInt, Type
};

mod rules;

use rules::Rule;

fn extract_error_type(attrs: &[Attribute]) -> syn::Result<TokenStream2> {
    for attr in attrs.iter().filter(|a| a.path().is_ident("validate_error")) {
        let mut ty = None;
        attr.parse_nested_meta(|meta| {
            ty = Some(meta.path.to_token_stream());
            Ok(())
        })?;
        if let Some(t) = ty {
            return Ok(t);
        }
    }
    Ok(quote! { ::std::string::String })
}

fn extract_rules(attrs: &[Attribute]) -> syn::Result<Vec<Rule>> {
    let mut out = vec![];
    for attr in attrs.iter().filter(|a| a.path().is_ident("validate")) {
        attr.parse_nested_meta(|meta| {
            let Some(id) = meta.path.get_ident() else {
                return Err(meta.error("expected a rule name"));
            };
            if meta.input.peek(syn::Token![=]) {
                let lit: LitInt = meta.value()?.parse()?;
                out.push(Rule::WithArg(id.to_string(), lit.base10_parse()?));
            } else {
                out.push(Rule::Plain(id.to_string()));
            }
            Ok(())
        })?;
    }
    Ok(out)
}

/// Only allow rules on String for now.
fn is_string_type(ty: &Type) -> bool {
    match ty {
        Type::Path(p) => p.path.segments.last().map(|s| s.ident == "String").unwrap_or(false),
        Type::Reference(r) => {
            if let Type::Path(p) = &*r.elem {
                p.path.segments.last().map(|s| s.ident == "String").unwrap_or(false)
            } else { false }
        }
        _ => false,
    }
}

/// Derives a checked `new` constructor.
///
/// Field rules (`#[validate(non_empty, digits, len = 3)]`) run in declaration order and the
/// first failing rule returns `Err(E::from(message))`, where `E` is named by
/// `#[validate_error(E)]` (defaults to `String`) and must implement `From<String>`.
/// Struct-level rules apply to every field without its own `#[validate(..)]`.
#[proc_macro_derive(Validate, attributes(validate, validate_error))]
pub fn derive_validate(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as DeriveInput);
    match expand(ast) {
        Ok(ts) => ts.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn expand(ast: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = ast.ident;
    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();
    let error_type = extract_error_type(&ast.attrs)?;
    let struct_rules = extract_rules(&ast.attrs)?;

    let mut ctor_params = vec![];
    let mut ctor_assigns = vec![];
    let mut validations = vec![];

    let fields = match ast.data {
        Data::Struct(s) => match s.fields {
            Fields::Named(n) => n.named,
            _ => return Ok(quote! { compile_error!("Validate supports named structs only"); }),
        },
        _ => return Ok(quote! { compile_error!("Validate can only be used on structs"); }),
    };

    for field in fields {
        let Some(ident) = field.ident else {
            continue;
        };
        let ty = field.ty;

        ctor_params.push(quote! { #ident: #ty });
        ctor_assigns.push(quote! { #ident });

        let mut field_rules = extract_rules(&field.attrs)?;
        if field_rules.iter().any(|r| r.name() == "skip") {
            continue;
        }
        if field_rules.is_empty() {
            field_rules = struct_rules.clone();
        }
        if field_rules.is_empty() {
            continue;
        }

        if !is_string_type(&ty) {
            let msg = format!("Validation rules can only be applied to String fields: {}", ident);
            return Ok(quote! { compile_error!(#msg); });
        }

        for rule in field_rules {
            let ts = match rules::dispatch(&rule, &ident) {
                Some(ts) => ts,
                None => {
                    let msg = format!("Unknown rule `{}`", rule.name());
                    return Ok(quote! { compile_error!(#msg); });
                }
            };
            validations.push(ts);
        }
    }

    Ok(quote! {
        impl #impl_generics #struct_name #ty_generics #where_clause {
            pub fn new(
                #(#ctor_params),*
            ) -> ::std::result::Result<Self, #error_type> {

                type E = #error_type;

                #(
                    #validations
                )*

                Ok(Self {
                    #(#ctor_assigns),*
                })
            }
        }
    })
}
