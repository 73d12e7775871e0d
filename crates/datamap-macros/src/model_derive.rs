//! Implementation of the Model derive macro.
//!
//! Every named field becomes a member readable through `get_field` and
//! assignable through `set_field`, unless it carries `#[datamap(skip)]`.

use proc_macro2::TokenStream;
use quote::{ToTokens, quote};
use syn::{Data, DeriveInput, Error, Field, Fields, Ident, Lit, Result, Type};

/// Plain or schema-qualified identifier, as accepted at runtime.
const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$";

/// Parsed definition of a struct with `#[derive(Model)]`.
#[derive(Debug)]
pub struct ModelDef {
    /// The struct name.
    pub name: Ident,
    /// Table name for implicit maps.
    pub table: String,
    /// Mapped members, in declaration order.
    pub fields: Vec<MemberDef>,
    /// Generics from the struct.
    pub generics: syn::Generics,
}

/// One mapped member.
#[derive(Debug)]
pub struct MemberDef {
    /// The Rust field.
    pub ident: Ident,
    /// The field type.
    pub ty: Type,
    /// Name exposed to maps.
    pub member: String,
}

/// Parse a `DeriveInput` into a `ModelDef`.
pub fn parse_model(input: &DeriveInput) -> Result<ModelDef> {
    let name = input.ident.clone();
    let generics = input.generics.clone();

    let fields = match &input.data {
        Data::Struct(data) => parse_members(&data.fields)?,
        Data::Enum(_) => {
            return Err(Error::new_spanned(
                input,
                "Model can only be derived for structs, not enums",
            ));
        }
        Data::Union(_) => {
            return Err(Error::new_spanned(
                input,
                "Model can only be derived for structs, not unions",
            ));
        }
    };

    let mut table = None;
    for attr in &input.attrs {
        if !attr.path().is_ident("datamap") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                let value: Lit = meta.value()?.parse()?;
                table = Some(identifier_lit(&value, "table")?);
                Ok(())
            } else {
                let attr_name = meta.path.to_token_stream().to_string();
                Err(Error::new_spanned(
                    &meta.path,
                    format!("unknown datamap attribute `{attr_name}` on struct. Valid attributes are: table"),
                ))
            }
        })?;
    }

    let mut seen = std::collections::HashSet::new();
    for field in &fields {
        if !seen.insert(field.member.as_str()) {
            return Err(Error::new_spanned(
                &field.ident,
                format!("duplicate member name `{}`", field.member),
            ));
        }
    }

    Ok(ModelDef {
        table: table.unwrap_or_else(|| to_snake_case(&name.to_string())),
        name,
        fields,
        generics,
    })
}

fn parse_members(fields: &Fields) -> Result<Vec<MemberDef>> {
    match fields {
        Fields::Named(named) => {
            let mut members = Vec::new();
            for field in &named.named {
                if let Some(member) = parse_member(field)? {
                    members.push(member);
                }
            }
            Ok(members)
        }
        Fields::Unnamed(_) => Err(Error::new_spanned(
            fields,
            "Model requires a struct with named fields",
        )),
        Fields::Unit => Ok(Vec::new()),
    }
}

/// Parse a field and its `#[datamap(...)]` attributes; `None` when skipped.
fn parse_member(field: &Field) -> Result<Option<MemberDef>> {
    let ident = field
        .ident
        .clone()
        .ok_or_else(|| Error::new_spanned(field, "expected named field"))?;

    let mut skip = false;
    let mut rename = None;
    for attr in &field.attrs {
        if !attr.path().is_ident("datamap") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                skip = true;
            } else if meta.path.is_ident("rename") {
                let value: Lit = meta.value()?.parse()?;
                rename = Some(identifier_lit(&value, "rename")?);
            } else {
                let attr_name = meta.path.to_token_stream().to_string();
                return Err(Error::new_spanned(
                    &meta.path,
                    format!("unknown datamap attribute `{attr_name}`. Valid attributes are: skip, rename"),
                ));
            }
            Ok(())
        })?;
    }

    if skip {
        return Ok(None);
    }
    let member = rename.unwrap_or_else(|| ident.to_string().trim_start_matches("r#").to_string());
    Ok(Some(MemberDef {
        ident,
        ty: field.ty.clone(),
        member,
    }))
}

/// A string literal holding a valid identifier.
fn identifier_lit(lit: &Lit, what: &str) -> Result<String> {
    let Lit::Str(lit_str) = lit else {
        return Err(Error::new_spanned(
            lit,
            format!("expected string literal for {what}"),
        ));
    };
    let value = lit_str.value();
    let regex = regex::Regex::new(IDENTIFIER_PATTERN)
        .map_err(|e| Error::new_spanned(lit_str, format!("invalid identifier pattern: {e}")))?;
    if !regex.is_match(&value) {
        return Err(Error::new_spanned(
            lit_str,
            format!("`{value}` is not a valid {what} identifier"),
        ));
    }
    Ok(value)
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Generate the `Model` implementation.
pub fn generate_model_impl(def: &ModelDef) -> TokenStream {
    let name = &def.name;
    let table = &def.table;
    let (impl_generics, ty_generics, where_clause) = def.generics.split_for_impl();

    let members: Vec<&str> = def.fields.iter().map(|f| f.member.as_str()).collect();

    let getters = def.fields.iter().map(|f| {
        let ident = &f.ident;
        let ty = &f.ty;
        let member = &f.member;
        quote! {
            #member => ::core::option::Option::Some(
                <#ty as ::core::convert::Into<datamap_core::Value>>::into(
                    ::core::clone::Clone::clone(&self.#ident),
                ),
            ),
        }
    });

    let setters = def.fields.iter().map(|f| {
        let ident = &f.ident;
        let ty = &f.ty;
        let member = &f.member;
        quote! {
            #member => {
                self.#ident = value.convert::<#ty>(name)?;
                true
            }
        }
    });

    quote! {
        impl #impl_generics datamap_core::Model for #name #ty_generics #where_clause {
            const TABLE_NAME: &'static str = #table;

            fn fields() -> &'static [&'static str] {
                &[#(#members),*]
            }

            #[allow(unused_variables)]
            fn get_field(&self, name: &str) -> ::core::option::Option<datamap_core::Value> {
                match name {
                    #(#getters)*
                    _ => ::core::option::Option::None,
                }
            }

            #[allow(unused_variables)]
            fn set_field(
                &mut self,
                name: &str,
                value: &datamap_core::Value,
            ) -> datamap_core::Result<bool> {
                let known = match name {
                    #(#setters)*
                    _ => false,
                };
                ::core::result::Result::Ok(known)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn test_default_table_is_snake_case() {
        let input: DeriveInput = parse_quote! {
            struct OrderLine {
                id: Option<i64>,
                product: String,
            }
        };
        let def = parse_model(&input).unwrap();
        assert_eq!(def.table, "order_line");
        let members: Vec<_> = def.fields.iter().map(|f| f.member.as_str()).collect();
        assert_eq!(members, vec!["id", "product"]);
    }

    #[test]
    fn test_table_skip_and_rename() {
        let input: DeriveInput = parse_quote! {
            #[datamap(table = "orders")]
            struct Order {
                id: Option<i64>,
                #[datamap(rename = "notes")]
                note: String,
                #[datamap(skip)]
                lines: Vec<u8>,
            }
        };
        let def = parse_model(&input).unwrap();
        assert_eq!(def.table, "orders");
        let members: Vec<_> = def.fields.iter().map(|f| f.member.as_str()).collect();
        assert_eq!(members, vec!["id", "notes"]);
    }

    #[test]
    fn test_rejects_invalid_identifier() {
        let input: DeriveInput = parse_quote! {
            #[datamap(table = "bad table")]
            struct Order {
                id: Option<i64>,
            }
        };
        assert!(parse_model(&input).is_err());
    }

    #[test]
    fn test_rejects_duplicate_member() {
        let input: DeriveInput = parse_quote! {
            struct Order {
                id: Option<i64>,
                #[datamap(rename = "id")]
                other: Option<i64>,
            }
        };
        assert!(parse_model(&input).is_err());
    }

    #[test]
    fn test_rejects_enums_and_tuple_structs() {
        let input: DeriveInput = parse_quote! {
            enum Kind { A, B }
        };
        assert!(parse_model(&input).is_err());

        let input: DeriveInput = parse_quote! {
            struct Pair(i64, i64);
        };
        assert!(parse_model(&input).is_err());
    }

    #[test]
    fn test_generated_impl_mentions_members() {
        let input: DeriveInput = parse_quote! {
            struct Customer {
                id: Option<i64>,
                name: String,
            }
        };
        let tokens = generate_model_impl(&parse_model(&input).unwrap()).to_string();
        assert!(tokens.contains("TABLE_NAME"));
        assert!(tokens.contains("\"customer\""));
        assert!(tokens.contains("\"name\""));
    }
}
