//! Builtin validation rules.
//!
//! Every rule expands to a block that returns early with `Err(E::from(String))`.
//! Add new rules to [`dispatch`].

use proc_macro2::{Ident, TokenStream};
use quote::quote;

#[derive(Debug, Clone)]
pub(crate) enum Rule {
    Plain(String),
    WithArg(String, usize),
}

impl Rule {
    pub(crate) fn name(&self) -> &str {
        match self {
            Rule::Plain(name) | Rule::WithArg(name, _) => name,
        }
    }
}

pub(crate) fn dispatch(rule: &Rule, value: &Ident) -> Option<TokenStream> {
    match rule {
        Rule::Plain(name) => match name.as_str() {
            "non_empty" => Some(non_empty(value)),
            "digits" => Some(digits(value)),
            "no_special_chars" => Some(no_special_chars(value)),
            _ => None,
        },
        Rule::WithArg(name, arg) => match name.as_str() {
            "len" => Some(exact_len(value, *arg)),
            "max_len" => Some(max_len(value, *arg)),
            _ => None,
        },
    }
}

/// Rule: non_empty
fn non_empty(value: &Ident) -> TokenStream {
    quote! {
        if #value.trim().is_empty() {
            return Err(E::from(format!("{} must be non-empty", stringify!(#value))));
        }
    }
}

/// Rule: digits (ASCII digits only)
fn digits(value: &Ident) -> TokenStream {
    quote! {
        if !#value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(E::from(format!("{} must contain only digits", stringify!(#value))));
        }
    }
}

/// Rule: no_special_chars
fn no_special_chars(value: &Ident) -> TokenStream {
    quote! {
        if #value.contains(|c: char| !(c.is_alphanumeric() || c.is_whitespace())) {
            return Err(E::from(format!("{} must not contain special characters", stringify!(#value))));
        }
    }
}

/// Rule: len = N, exact length in characters
fn exact_len(value: &Ident, expected: usize) -> TokenStream {
    quote! {
        if #value.chars().count() != #expected {
            return Err(E::from(format!(
                "{} must be exactly {} characters, got {}",
                stringify!(#value),
                #expected,
                #value.chars().count()
            )));
        }
    }
}

/// Rule: max_len = N
fn max_len(value: &Ident, max: usize) -> TokenStream {
    quote! {
        if #value.chars().count() > #max {
            return Err(E::from(format!(
                "{} must be at most {} characters",
                stringify!(#value),
                #max
            )));
        }
    }
}
