//! Derive macros for widget-core configuration schemas.
//!
//! This crate provides the `#[derive(WidgetConfig)]` macro, which builds a
//! `ConfigSchema` from a struct's fields.
//!
//! # Example
//!
//! ```ignore
//! use widget_core::schema::WidgetConfig;
//!
//! #[derive(WidgetConfig)]
//! #[widget_config(strict)]
//! struct GalleryConfig {
//!     #[field(desc = "Heading above the photos", max_len = 60)]
//!     title: String,
//!
//!     #[field(desc = "Photos per row", default = "3", min = 1, max = 6)]
//!     columns: Option<u32>,
//!
//!     #[field(enum_values = "grid,carousel", default = "\"grid\"")]
//!     layout: Option<String>,
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse_macro_input, spanned::Spanned, Data, DeriveInput, Error, Fields, Ident, Lit, LitBool,
    LitInt, LitStr, Type,
};

/// Derive macro for implementing the `WidgetConfig` trait.
///
/// # Attributes
///
/// ## Struct-level
///
/// - `#[widget_config(strict)]` - Reject configuration keys that are not fields.
///
/// ## Field-level
///
/// - `#[field(desc = "...")]` - Field description.
/// - `#[field(required = false)]` - Mark field as optional (also inferred from `Option<T>`).
/// - `#[field(default = "...")]` - Default value as JSON; anything that is not
///   valid JSON is used as a plain string.
/// - `#[field(enum_values = "a,b,c")]` - Treat field as enum with explicit allowed values.
/// - `#[field(min = N, max = N)]` - Numeric bounds.
/// - `#[field(min_len = N, max_len = N)]` - Length bounds for strings and lists.
/// - `#[field(pattern = "regex")]` - Strings must match.
#[proc_macro_derive(WidgetConfig, attributes(widget_config, field))]
pub fn derive_widget_config(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match derive_widget_config_impl(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn derive_widget_config_impl(input: DeriveInput) -> Result<TokenStream2, Error> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let struct_attrs = parse_struct_attrs(&input)?;

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(Error::new(
                    input.ident.span(),
                    "WidgetConfig can only be derived for structs with named fields",
                ))
            }
        },
        _ => {
            return Err(Error::new(
                input.ident.span(),
                "WidgetConfig can only be derived for structs",
            ))
        }
    };

    let mut specs = Vec::new();
    for field in fields {
        let Some(field_name) = field.ident.clone() else {
            return Err(Error::new(field.span(), "expected a named field"));
        };
        let parsed = ParsedField {
            name: field_name,
            ty: field.ty.clone(),
            attrs: parse_field_attrs(field)?,
        };
        specs.push(generate_field_spec(&parsed));
    }

    let strict = if struct_attrs.strict {
        quote! { .strict() }
    } else {
        quote! {}
    };

    Ok(quote! {
        impl #impl_generics ::widget_core::schema::WidgetConfig for #name #ty_generics #where_clause {
            fn schema() -> ::widget_core::schema::ConfigSchema {
                ::widget_core::schema::ConfigSchema::new(vec![
                    #(#specs),*
                ])
                #strict
            }
        }
    })
}

/// Parsed struct-level attributes.
#[derive(Default)]
struct StructAttrs {
    strict: bool,
}

/// Parse #[widget_config(...)] attributes.
fn parse_struct_attrs(input: &DeriveInput) -> Result<StructAttrs, Error> {
    let mut result = StructAttrs::default();

    for attr in &input.attrs {
        if !attr.path().is_ident("widget_config") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("strict") {
                result.strict = true;
                Ok(())
            } else {
                Err(meta.error("unknown widget_config attribute, expected 'strict'"))
            }
        })?;
    }

    Ok(result)
}

/// Parsed field attributes.
#[derive(Default)]
struct FieldAttrs {
    desc: Option<String>,
    required: Option<bool>,
    default: Option<String>,
    enum_values: Option<Vec<String>>,
    min: Option<f64>,
    max: Option<f64>,
    min_len: Option<usize>,
    max_len: Option<usize>,
    pattern: Option<String>,
}

/// Parse #[field(...)] attributes.
fn parse_field_attrs(field: &syn::Field) -> Result<FieldAttrs, Error> {
    let mut result = FieldAttrs::default();

    for attr in &field.attrs {
        if !attr.path().is_ident("field") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("desc") {
                let value: LitStr = meta.value()?.parse()?;
                result.desc = Some(value.value());
            } else if meta.path.is_ident("required") {
                let value: LitBool = meta.value()?.parse()?;
                result.required = Some(value.value());
            } else if meta.path.is_ident("default") {
                let value: LitStr = meta.value()?.parse()?;
                result.default = Some(value.value());
            } else if meta.path.is_ident("enum_values") {
                let value: LitStr = meta.value()?.parse()?;
                let parsed = value
                    .value()
                    .split(',')
                    .map(|v| v.trim())
                    .filter(|v| !v.is_empty())
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>();
                if parsed.is_empty() {
                    return Err(meta.error("enum_values cannot be empty"));
                }
                result.enum_values = Some(parsed);
            } else if meta.path.is_ident("min") {
                result.min = Some(parse_number(meta.value()?)?);
            } else if meta.path.is_ident("max") {
                result.max = Some(parse_number(meta.value()?)?);
            } else if meta.path.is_ident("min_len") {
                let value: LitInt = meta.value()?.parse()?;
                result.min_len = Some(value.base10_parse()?);
            } else if meta.path.is_ident("max_len") {
                let value: LitInt = meta.value()?.parse()?;
                result.max_len = Some(value.base10_parse()?);
            } else if meta.path.is_ident("pattern") {
                let value: LitStr = meta.value()?.parse()?;
                result.pattern = Some(value.value());
            } else {
                return Err(meta.error(
                    "unknown field attribute, expected 'desc', 'required', 'default', \
                     'enum_values', 'min', 'max', 'min_len', 'max_len' or 'pattern'",
                ));
            }
            Ok(())
        })?;
    }

    if let (Some(min), Some(max)) = (result.min, result.max) {
        if min > max {
            return Err(Error::new(field.span(), "min must not be greater than max"));
        }
    }

    Ok(result)
}

/// Parse an integer or float literal, optionally negated.
fn parse_number(input: syn::parse::ParseStream) -> Result<f64, Error> {
    let negative = input.peek(syn::Token![-]);
    if negative {
        input.parse::<syn::Token![-]>()?;
    }
    let lit: Lit = input.parse()?;
    let value = match &lit {
        Lit::Int(int) => int.base10_parse::<f64>()?,
        Lit::Float(float) => float.base10_parse::<f64>()?,
        other => return Err(Error::new(other.span(), "expected a number")),
    };
    Ok(if negative { -value } else { value })
}

/// A parsed field with its attributes.
struct ParsedField {
    name: Ident,
    ty: Type,
    attrs: FieldAttrs,
}

/// Generate FieldSpec construction code for a field.
fn generate_field_spec(field: &ParsedField) -> TokenStream2 {
    let name_str = field.name.to_string();
    let field_type = if let Some(values) = &field.attrs.enum_values {
        let value_literals: Vec<_> = values
            .iter()
            .map(|value| LitStr::new(value, field.name.span()))
            .collect();
        quote! {
            ::widget_core::schema::FieldType::Enum(vec![
                #(::std::string::String::from(#value_literals)),*
            ])
        }
    } else {
        infer_field_type(&field.ty)
    };

    let desc = field.attrs.desc.as_deref().unwrap_or("");

    // Option<T> fields are optional unless stated otherwise
    let is_option = is_option_type(&field.ty);
    let required = field.attrs.required.unwrap_or(!is_option);

    let mut builder = quote! {
        ::widget_core::schema::FieldSpec::new(#name_str, #field_type)
            .with_description(#desc)
    };

    if !required {
        builder = quote! { #builder.optional() };
    }

    if let Some(default) = &field.attrs.default {
        builder = quote! {
            #builder.with_default(::widget_core::schema::parse_default(#default))
        };
    }

    let constraint = |tokens: TokenStream2| {
        quote! { .with_constraint(::widget_core::schema::FieldConstraint::#tokens) }
    };
    let mut constraints = Vec::new();
    if let Some(min) = field.attrs.min {
        constraints.push(constraint(quote! { Min(#min) }));
    }
    if let Some(max) = field.attrs.max {
        constraints.push(constraint(quote! { Max(#max) }));
    }
    if let Some(min_len) = field.attrs.min_len {
        constraints.push(constraint(quote! { MinLength(#min_len) }));
    }
    if let Some(max_len) = field.attrs.max_len {
        constraints.push(constraint(quote! { MaxLength(#max_len) }));
    }
    if let Some(pattern) = &field.attrs.pattern {
        constraints.push(constraint(
            quote! { Pattern(::std::string::String::from(#pattern)) },
        ));
    }

    quote! { #builder #(#constraints)* }
}

/// Infer FieldType from a Rust type.
fn infer_field_type(ty: &Type) -> TokenStream2 {
    let Type::Path(type_path) = ty else {
        return quote! { ::widget_core::schema::FieldType::Custom("unknown".to_string()) };
    };
    let Some(segment) = type_path.path.segments.last() else {
        return quote! { ::widget_core::schema::FieldType::Custom("unknown".to_string()) };
    };

    let ident_str = segment.ident.to_string();
    match ident_str.as_str() {
        "String" | "str" => quote! { ::widget_core::schema::FieldType::String },
        "i8" | "i16" | "i32" | "i64" | "i128" | "isize" | "u8" | "u16" | "u32" | "u64"
        | "u128" | "usize" => quote! { ::widget_core::schema::FieldType::Integer },
        "f32" | "f64" => quote! { ::widget_core::schema::FieldType::Float },
        "bool" => quote! { ::widget_core::schema::FieldType::Boolean },
        "Map" | "HashMap" | "BTreeMap" => {
            quote! { ::widget_core::schema::FieldType::Object(Vec::new()) }
        }
        "Vec" => match first_type_argument(segment) {
            Some(inner_ty) => {
                let inner = infer_field_type(inner_ty);
                quote! { ::widget_core::schema::FieldType::List(Box::new(#inner)) }
            }
            None => quote! {
                ::widget_core::schema::FieldType::List(Box::new(
                    ::widget_core::schema::FieldType::String
                ))
            },
        },
        // Option<T> -> same as T
        "Option" => match first_type_argument(segment) {
            Some(inner_ty) => infer_field_type(inner_ty),
            None => quote! { ::widget_core::schema::FieldType::String },
        },
        _ => quote! { ::widget_core::schema::FieldType::Custom(#ident_str.to_string()) },
    }
}

fn first_type_argument(segment: &syn::PathSegment) -> Option<&Type> {
    match &segment.arguments {
        syn::PathArguments::AngleBracketed(args) => match args.args.first() {
            Some(syn::GenericArgument::Type(inner)) => Some(inner),
            _ => None,
        },
        _ => None,
    }
}

/// Check if a type is Option<T>.
fn is_option_type(ty: &Type) -> bool {
    if let Type::Path(type_path) = ty {
        if let Some(segment) = type_path.path.segments.last() {
            return segment.ident == "Option";
        }
    }
    false
}
