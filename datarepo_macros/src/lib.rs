//! Procedural macros for the `datarepo` repository library.
//!
//! This crate provides three macros:
//! - `#[derive(Entity)]`: inspects a struct and generates the entity metadata, the
//!   insert/update value extraction and a `RowAdapter` over engine records.
//! - `#[derive(Projection)]`: generates a closed read view over entity columns.
//! - `#[repository(...)]`: generates a repository struct whose derived-query finders and
//!   query-text methods are parsed once, when the repository is constructed.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote, ToTokens};
use syn::{
    parse::{Parse, ParseStream},
    parse_macro_input,
    punctuated::Punctuated,
    spanned::Spanned,
    Attribute, Data, DeriveInput, Fields, Ident, ItemMod, LitStr, Token, Type, TypePath,
};

use inflections::Inflect;

// --- Helper Structs & Functions for Parsing ---

/// A helper struct for parsing `key = "value"` style meta attributes.
struct MetaNameValue {
    pub path: syn::Path,
    pub _eq_token: Token![=],
    pub value: LitStr,
}

impl Parse for MetaNameValue {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        Ok(Self {
            path: input.parse()?,
            _eq_token: input.parse()?,
            value: input.parse()?,
        })
    }
}

/// The single generic argument of `Wrapper<T>` when the last path segment is `wrapper`.
fn generic_inner<'a>(ty: &'a Type, wrapper: &str) -> Option<&'a Type> {
    if let Type::Path(type_path) = ty {
        if let Some(segment) = type_path.path.segments.last() {
            if segment.ident == wrapper {
                if let syn::PathArguments::AngleBracketed(args) = &segment.arguments {
                    if let Some(syn::GenericArgument::Type(inner_ty)) = args.args.first() {
                        return Some(inner_ty);
                    }
                }
            }
        }
    }
    None
}

/// Helper to check if a type is an `Option<T>`.
fn is_option(ty: &Type) -> bool {
    generic_inner(ty, "Option").is_some()
}

/// The type as written, minus any leading module path (`datarepo::Ref<Team>` -> `Ref<Team>`).
fn type_name(ty: &Type) -> String {
    let tokens = match ty {
        Type::Path(tp) if tp.qself.is_none() => match tp.path.segments.last() {
            Some(last) => last.to_token_stream(),
            None => ty.to_token_stream(),
        },
        _ => ty.to_token_stream(),
    };
    tokens.to_string().replace(' ', "")
}

/// Path to the `<Entity>RowAdapter` generated next to an entity type.
fn adapter_path(ty: &Type) -> Option<TokenStream2> {
    match ty {
        Type::Path(tp) => {
            let mut p = tp.path.clone();
            let last = p.segments.last_mut()?;
            last.ident = Ident::new(&format!("{}RowAdapter", last.ident), last.ident.span());
            last.arguments = syn::PathArguments::None;
            Some(quote! { #p })
        }
        _ => None,
    }
}

fn is_valid_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|ch| ch == '_' || ch.is_ascii_alphanumeric())
}

/// Holds parsed metadata about a single struct field.
#[derive(Clone)]
struct FieldMetadata {
    ident: Ident,
    ty: Type,
    ty_str: String,
    column_name: String,
    is_id: bool,
    is_skipped: bool,
    /// Target entity of a `Ref<T>` field.
    ref_target: Option<Type>,
}

/// Parses all named fields from a `DeriveInput` struct.
fn parse_field_metadata(input: &DeriveInput) -> Vec<FieldMetadata> {
    let fields = match &input.data {
        Data::Struct(s) => match &s.fields {
            Fields::Named(named) => named,
            _ => panic!("#[derive(Entity)] only supports structs with named fields."),
        },
        _ => panic!("#[derive(Entity)] can only be used on structs."),
    };

    fields
        .named
        .iter()
        .filter_map(|field| field.ident.clone().map(|ident| (ident, field)))
        .map(|(ident, field)| {
            let ty = field.ty.clone();
            let ty_str = type_name(&ty);
            let ref_target = generic_inner(&ty, "Ref").cloned();
            let mut column_name = match ref_target {
                Some(_) => format!("{}_id", ident),
                None => ident.to_string(),
            };
            let mut is_id = false;
            let mut is_skipped = false;

            for attr in &field.attrs {
                if attr.path().is_ident("fetch") {
                    if let Ok(list) = attr.meta.require_list() {
                        // Propagate parse errors to cause a compile error for invalid meta, e.g., #[fetch(column)]
                        list.parse_nested_meta(|meta| {
                            if meta.path.is_ident("column") {
                                let s: LitStr = meta.value()?.parse()?;
                                column_name = s.value();
                            } else if meta.path.is_ident("id") {
                                is_id = true;
                            } else if meta.path.is_ident("skip") {
                                is_skipped = true;
                            } else {
                                return Err(meta.error("expected `id`, `skip` or `column = \"...\"`"));
                            }
                            Ok(())
                        })
                        .unwrap_or_else(|e| panic!("Invalid #[fetch(...)] attribute syntax: {}", e));
                    }
                }
            }
            FieldMetadata {
                ident,
                ty,
                ty_str,
                column_name,
                is_id,
                is_skipped,
                ref_target,
            }
        })
        .collect()
}

const SUPPORTED_SCALARS: &[&str] = &["String", "i32", "i64", "f64", "bool"];

fn is_supported_value(ty: &Type) -> bool {
    let inner = generic_inner(ty, "Option").unwrap_or(ty);
    SUPPORTED_SCALARS.contains(&type_name(inner).as_str())
}

// --- `Entity` derive macro ---

#[proc_macro_derive(Entity, attributes(entity, fetch))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let struct_name = &input.ident;
    let entity_name = struct_name.to_string();
    let fields_metadata = parse_field_metadata(&input);

    // --- Get table name ---
    // Look for `#[entity(table = "...")]` first.
    let table_name_override = input.attrs.iter().find_map(|attr| {
        if attr.path().is_ident("entity") {
            if let Ok(meta) = attr.meta.require_list() {
                let parsed: Result<MetaNameValue, _> = syn::parse2(meta.tokens.clone());
                if let Ok(MetaNameValue { path, value, .. }) = parsed {
                    if path.is_ident("table") {
                        return Some(value.value());
                    }
                }
            }
        }
        None
    });

    // If no override, deduce it from the struct name (`Member` -> `members`).
    let table_name =
        table_name_override.unwrap_or_else(|| format!("{}s", entity_name.to_snake_case()));

    if !is_valid_ident(&table_name) {
        panic!("Invalid table name `{}`. Use ASCII letters, digits, or `_`, starting with a letter or `_`.", table_name);
    }
    for f in &fields_metadata {
        if !f.is_skipped && !is_valid_ident(&f.column_name) {
            panic!("Invalid column name `{}`. Use ASCII letters, digits, or `_`, starting with a letter or `_`.", f.column_name);
        }
        if !f.is_skipped && f.ref_target.is_none() && !is_supported_value(&f.ty) {
            panic!("Unsupported field type `{}` on `{}`. Hint: use String/i32/i64/f64/bool (optionally in Option), Ref<Entity> for a many-to-one relation, or mark the field with #[fetch(skip)].", f.ty_str, f.ident);
        }
    }

    // --- Validate exactly one #[fetch(id)] ---
    let id_count = fields_metadata.iter().filter(|f| f.is_id).count();
    if id_count == 0 {
        panic!("A field must be marked with #[fetch(id)]. Hint: mark your primary key field like `#[fetch(id)]`.");
    } else if id_count > 1 {
        panic!("Exactly one field must be marked with #[fetch(id)] (found {}). Remove extra #[fetch(id)] attributes.", id_count);
    }
    let Some(id_field) = fields_metadata.iter().find(|f| f.is_id) else {
        unreachable!("validated id_count == 1")
    };

    // --- Implement `Fetchable` ---
    let persisted: Vec<&FieldMetadata> = fields_metadata.iter().filter(|f| !f.is_skipped).collect();
    let select_columns: Vec<_> = persisted.iter().map(|f| &f.column_name).collect();
    let findable_columns: Vec<_> = persisted
        .iter()
        .filter(|f| !f.is_id)
        .map(|f| {
            let col = &f.column_name;
            let ty_str = &f.ty_str;
            quote! { (#col, #ty_str) }
        })
        .collect();
    let relations: Vec<_> = persisted
        .iter()
        .filter_map(|f| f.ref_target.as_ref().map(|target| (f, target)))
        .map(|(f, target)| {
            let name = f.ident.to_string();
            let column = &f.column_name;
            quote! {
                ::datarepo_core::Relation {
                    name: #name,
                    column: #column,
                    entity: <#target as ::datarepo_core::Fetchable>::ENTITY_NAME,
                    table: <#target as ::datarepo_core::Fetchable>::TABLE,
                    id_column: <#target as ::datarepo_core::Identifiable>::ID_COLUMN,
                    columns: <#target as ::datarepo_core::Fetchable>::SELECT_COLUMNS,
                    findable: <#target as ::datarepo_core::Fetchable>::FINDABLE_COLUMNS,
                }
            }
        })
        .collect();

    let fetchable_impl = quote! {
        impl ::datarepo_core::Fetchable for #struct_name {
            const ENTITY_NAME: &'static str = #entity_name;
            const TABLE: &'static str = #table_name;
            const SELECT_COLUMNS: &'static [&'static str] = &[#(#select_columns),*];
            const FINDABLE_COLUMNS: &'static [(&'static str, &'static str)] = &[#(#findable_columns),*];
            const RELATIONS: &'static [::datarepo_core::Relation] = &[#(#relations),*];
        }
    };

    // --- Implement `Identifiable` ---
    let id_ident = &id_field.ident;
    let id_ty = &id_field.ty;
    let key_ty = generic_inner(id_ty, "Option").unwrap_or(id_ty);
    let id_column_name = &id_field.column_name;

    let (id_accessor, id_setter) = if is_option(id_ty) {
        (
            quote! { self.#id_ident.clone() },
            quote! { Self { #id_ident: Some(id), ..self } },
        )
    } else {
        (
            quote! { Some(self.#id_ident.clone()) },
            quote! { Self { #id_ident: id, ..self } },
        )
    };

    let identifiable_impl = quote! {
        impl ::datarepo_core::Identifiable for #struct_name {
            type Key = #key_ty;
            const ID_COLUMN: &'static str = #id_column_name;
            fn id(&self) -> Option<Self::Key> {
                #id_accessor
            }
            fn with_id(self, id: Self::Key) -> Self {
                #id_setter
            }
        }
    };

    // --- Implement `Insertable` and `Updatable` ---
    let to_param_value = |field: &FieldMetadata| {
        let ident = &field.ident;
        if field.ref_target.is_some() {
            quote! { self.#ident.to_param() }
        } else {
            quote! { ::datarepo_core::ParamValue::from(::core::clone::Clone::clone(&self.#ident)) }
        }
    };

    let value_fields: Vec<_> = persisted.iter().filter(|f| !f.is_id).collect();
    let value_columns: Vec<_> = value_fields.iter().map(|f| &f.column_name).collect();
    let values: Vec<_> = value_fields.iter().map(|f| to_param_value(f)).collect();

    let insertable_impl = quote! {
        impl ::datarepo_core::Insertable for #struct_name {
            const INSERT_COLUMNS: &'static [&'static str] = &[#(#value_columns),*];
            fn insert_values(&self) -> Vec<::datarepo_core::ParamValue> {
                vec![#(#values),*]
            }
        }
    };

    let updatable_impl = quote! {
        impl ::datarepo_core::Updatable for #struct_name {
            const UPDATE_COLUMNS: &'static [&'static str] = &[#(#value_columns),*];
            fn update_values(&self) -> Vec<::datarepo_core::ParamValue> {
                vec![#(#values),*]
            }
        }
    };

    // --- Generate `RowAdapter` ---
    let adapter_struct_name = Ident::new(&format!("{}RowAdapter", struct_name), struct_name.span());

    let row_mappings: Vec<_> = fields_metadata
        .iter()
        .map(|f| {
            let ident = &f.ident;
            if f.is_skipped {
                return quote! { #ident: ::core::default::Default::default() };
            }
            let col_name_lit = LitStr::new(&f.column_name, ident.span());
            match &f.ref_target {
                Some(target) => {
                    let relation = LitStr::new(&ident.to_string(), ident.span());
                    let target_adapter = adapter_path(target)
                        .unwrap_or_else(|| panic!("Ref<...> target of `{}` must be a type path", ident));
                    quote! {
                        #ident: ::datarepo_core::Ref::from_parts(row, #col_name_lit, #relation, &#target_adapter)?
                    }
                }
                None => quote! { #ident: row.try_get(#col_name_lit)? },
            }
        })
        .collect();

    let row_adapter_impl = quote! {
        #[derive(Debug, Clone, Copy, Default)]
        pub struct #adapter_struct_name;

        impl ::datarepo_core::RowAdapter<#struct_name> for #adapter_struct_name {
            type Row = ::datarepo_core::Record;
            fn from_row(&self, row: &Self::Row) -> ::datarepo_core::RepoResult<#struct_name> {
                Ok(#struct_name {
                    #(#row_mappings),*
                })
            }
        }
    };

    // --- Combine all generated code ---
    let expanded = quote! {
        #fetchable_impl
        #identifiable_impl
        #insertable_impl
        #updatable_impl
        #row_adapter_impl
    };

    TokenStream::from(expanded)
}

// --- `Projection` derive macro ---

#[proc_macro_derive(Projection, attributes(projection))]
pub fn derive_projection(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let struct_name = &input.ident;
    let fields = match &input.data {
        Data::Struct(s) => match &s.fields {
            Fields::Named(named) => named,
            _ => panic!("#[derive(Projection)] only supports structs with named fields."),
        },
        _ => panic!("#[derive(Projection)] can only be used on structs."),
    };

    let mut reads = Vec::new();
    let mut columns = Vec::new();
    let mut optional = Vec::new();
    for field in &fields.named {
        let Some(ident) = &field.ident else { continue };
        let ty = &field.ty;
        let mut column = ident.to_string();
        let mut nested = false;
        for attr in &field.attrs {
            if attr.path().is_ident("projection") {
                attr.parse_nested_meta(|meta| {
                    if meta.path.is_ident("column") {
                        let s: LitStr = meta.value()?.parse()?;
                        column = s.value();
                    } else if meta.path.is_ident("nested") {
                        nested = true;
                    } else {
                        return Err(meta.error("expected `nested` or `column = \"...\"`"));
                    }
                    Ok(())
                })
                .unwrap_or_else(|e| panic!("Invalid #[projection(...)] attribute syntax: {}", e));
            }
        }
        if nested {
            reads.push(quote! {
                #ident: <#ty as ::datarepo_core::projection::FromRecord>::from_record(&record.scoped(#column))?
            });
            columns.push(quote! {
                cols.extend(::datarepo_core::projection::nested(
                    #column,
                    <#ty as ::datarepo_core::projection::Projection>::columns(),
                ));
            });
            optional.push(quote! {
                if <#ty as ::datarepo_core::projection::Projection>::OPTIONAL {
                    rels.push(::std::string::String::from(#column));
                }
            });
        } else {
            reads.push(quote! { #ident: record.try_get(#column)? });
            columns.push(quote! {
                cols.push(::datarepo_core::query::Path::from(#column));
            });
        }
    }

    let expanded = quote! {
        impl ::datarepo_core::projection::FromRecord for #struct_name {
            fn from_record(record: &::datarepo_core::Record) -> ::datarepo_core::RepoResult<Self> {
                Ok(Self {
                    #(#reads),*
                })
            }
        }

        impl ::datarepo_core::projection::Projection for #struct_name {
            fn columns() -> Vec<::datarepo_core::query::Path> {
                let mut cols = Vec::new();
                #(#columns)*
                cols
            }

            #[allow(unused_mut)]
            fn optional_relations() -> Vec<::std::string::String> {
                let mut rels = Vec::new();
                #(#optional)*
                rels
            }
        }
    };

    TokenStream::from(expanded)
}

// --- `repository` attribute macro ---

/// What a repository method returns.
enum Kind {
    Vec,
    Option,
    Page,
    Slice,
    Count,
    Exists,
    Delete,
    Projected(Type),
    Scalars(Type),
    Rows(Type),
    Modifying,
}

impl Parse for Kind {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let ident: Ident = input.parse()?;
        let with_type = |ident: &Ident| -> syn::Result<Type> {
            input.parse::<Token![<]>().map_err(|_| {
                syn::Error::new(ident.span(), format!("`{}` needs a type argument, e.g. `{}<T>`", ident, ident))
            })?;
            let ty: Type = input.parse()?;
            input.parse::<Token![>]>()?;
            Ok(ty)
        };
        Ok(match ident.to_string().as_str() {
            "Vec" => Kind::Vec,
            "Option" => Kind::Option,
            "Page" => Kind::Page,
            "Slice" => Kind::Slice,
            "Count" => Kind::Count,
            "Exists" => Kind::Exists,
            "Delete" => Kind::Delete,
            "Modifying" => Kind::Modifying,
            "Projected" => Kind::Projected(with_type(&ident)?),
            "Scalars" => Kind::Scalars(with_type(&ident)?),
            "Rows" => Kind::Rows(with_type(&ident)?),
            other => {
                return Err(syn::Error::new(
                    ident.span(),
                    format!("Unknown result kind `{}`. Expected one of: Vec, Option, Page, Slice, Count, Exists, Delete, Projected<P>, Scalars<V>, Rows<R>, Modifying", other),
                ))
            }
        })
    }
}

struct Arg {
    name: Ident,
    ty: Type,
}

impl Parse for Arg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let name: Ident = input.parse()?;
        input.parse::<Token![:]>()?;
        let ty: Type = input.parse()?;
        Ok(Arg { name, ty })
    }
}

/// A method declaration such as
/// `#[hints(read_only)] find_by_username(username: String) -> Vec`, optionally followed
/// by `= "query text"`.
struct Method {
    attrs: Vec<Attribute>,
    name: Ident,
    args: Punctuated<Arg, Token![,]>,
    kind: Kind,
    text: Option<LitStr>,
}

impl Parse for Method {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let attrs = input.call(Attribute::parse_outer)?;
        let name: Ident = input.parse()?;
        let content;
        syn::parenthesized!(content in input);
        let args = content.parse_terminated(Arg::parse, Token![,])?;
        input.parse::<Token![->]>()?;
        let kind: Kind = input.parse()?;
        let text = if input.peek(Token![=]) {
            input.parse::<Token![=]>()?;
            Some(input.parse()?)
        } else {
            None
        };
        Ok(Method {
            attrs,
            name,
            args,
            kind,
            text,
        })
    }
}

/// Struct for parsing the main macro arguments
struct RepositoryArgs {
    entity: Type,
    custom: Option<Type>,
    finders: Vec<Method>,
    queries: Vec<Method>,
}

fn expr_to_type(expr: syn::Expr, what: &str) -> syn::Result<Type> {
    if let syn::Expr::Path(expr_path) = expr {
        Ok(Type::Path(TypePath {
            qself: None,
            path: expr_path.path,
        }))
    } else {
        Err(syn::Error::new(expr.span(), format!("Expected a type for `{}`", what)))
    }
}

impl Parse for RepositoryArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut entity = None;
        let mut custom = None;
        let mut finders = Vec::new();
        let mut queries = Vec::new();

        let attrs = Punctuated::<syn::Meta, Token![,]>::parse_terminated(input)?;
        for meta in attrs {
            match meta {
                syn::Meta::NameValue(nv) => {
                    let ident_str = nv
                        .path
                        .get_ident()
                        .ok_or_else(|| syn::Error::new(nv.path.span(), "Expected an identifier"))?
                        .to_string();
                    match ident_str.as_str() {
                        "entity" => entity = Some(expr_to_type(nv.value, "entity")?),
                        "custom" => custom = Some(expr_to_type(nv.value, "custom")?),
                        _ => return Err(syn::Error::new(nv.path.span(), "Unknown attribute")),
                    }
                }
                syn::Meta::List(list) => {
                    let parsed =
                        list.parse_args_with(Punctuated::<Method, Token![,]>::parse_terminated)?;
                    if list.path.is_ident("finders") {
                        finders.extend(parsed);
                    } else if list.path.is_ident("queries") {
                        queries.extend(parsed);
                    } else {
                        return Err(syn::Error::new(list.path.span(), "Unknown attribute list"));
                    }
                }
                _ => return Err(syn::Error::new(meta.span(), "Unsupported attribute format")),
            }
        }
        Ok(RepositoryArgs {
            entity: entity
                .ok_or_else(|| syn::Error::new(input.span(), "`entity` is a required attribute"))?,
            custom,
            finders,
            queries,
        })
    }
}

/// `#[hints(read_only, lock = "pessimistic_write", fetch = "team")]`
fn parse_hints(attrs: &[Attribute]) -> syn::Result<TokenStream2> {
    let mut hints = quote! { ::datarepo_core::hints::QueryHints::new() };
    for attr in attrs.iter().filter(|a| a.path().is_ident("hints")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("read_only") {
                hints = quote! { #hints.read_only() };
            } else if meta.path.is_ident("fetch") {
                let rel: LitStr = meta.value()?.parse()?;
                hints = quote! { #hints.fetch(#rel) };
            } else if meta.path.is_ident("lock") {
                let mode: LitStr = meta.value()?.parse()?;
                let mode = match mode.value().as_str() {
                    "pessimistic_read" => quote! { ::datarepo_core::query::LockMode::PessimisticRead },
                    "pessimistic_write" => quote! { ::datarepo_core::query::LockMode::PessimisticWrite },
                    _ => return Err(meta.error("lock must be \"pessimistic_read\" or \"pessimistic_write\"")),
                };
                hints = quote! { #hints.lock(#mode) };
            } else {
                return Err(meta.error("expected `read_only`, `fetch = \"...\"` or `lock = \"...\"`"));
            }
            Ok(())
        })?;
    }
    Ok(hints)
}

/// `#[modifying(flush_automatically, clear_automatically)]`
fn parse_bulk_options(attrs: &[Attribute]) -> syn::Result<TokenStream2> {
    let mut options = quote! { ::datarepo_core::hints::BulkOptions::new() };
    for attr in attrs.iter().filter(|a| a.path().is_ident("modifying")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("flush_automatically") {
                options = quote! { #options.flush_before() };
            } else if meta.path.is_ident("clear_automatically") {
                options = quote! { #options.clear_after() };
            } else {
                return Err(meta.error("expected `flush_automatically` or `clear_automatically`"));
            }
            Ok(())
        })?;
    }
    Ok(options)
}

fn check_attrs(method: &Method, allowed: &[&str]) -> syn::Result<()> {
    for attr in &method.attrs {
        if !allowed.iter().any(|a| attr.path().is_ident(a)) {
            return Err(syn::Error::new(
                attr.span(),
                format!("Unsupported attribute on `{}`; allowed here: {}", method.name, allowed.join(", ")),
            ));
        }
    }
    Ok(())
}

/// Field initializers plus the method, for one generated repository method.
struct Generated {
    fields: Vec<TokenStream2>,
    inits: Vec<TokenStream2>,
    method: TokenStream2,
}

fn signature_parts(method: &Method) -> (Vec<&Ident>, Vec<&Type>, Vec<TokenStream2>) {
    let names: Vec<&Ident> = method.args.iter().map(|a| &a.name).collect();
    let types: Vec<&Type> = method.args.iter().map(|a| &a.ty).collect();
    let values = names
        .iter()
        .map(|n| quote! { ::core::convert::Into::<::datarepo_core::ParamValue>::into(#n) })
        .collect();
    (names, types, values)
}

fn finder(method: &Method, entity: &Type) -> syn::Result<Generated> {
    check_attrs(method, &["hints"])?;
    let name = &method.name;
    let name_str = name.to_string();
    if method.text.is_some() {
        return Err(syn::Error::new(
            name.span(),
            "Finders derive their query from the method name; move methods with query text to `queries(...)`",
        ));
    }
    let query_field = format_ident!("{}_query", name);
    let hints_field = format_ident!("{}_hints", name);
    let hints = parse_hints(&method.attrs)?;
    let arity = method.args.len();
    let (names, types, values) = signature_parts(method);

    let subject = match &method.kind {
        Kind::Vec | Kind::Option | Kind::Page | Kind::Slice | Kind::Projected(_) => quote! { Find },
        Kind::Count => quote! { Count },
        Kind::Exists => quote! { Exists },
        Kind::Delete => quote! { Delete },
        Kind::Scalars(_) | Kind::Rows(_) | Kind::Modifying => {
            return Err(syn::Error::new(
                name.span(),
                "Scalars, Rows and Modifying need query text; declare the method in `queries(...)`",
            ))
        }
    };

    let args = quote! { vec![#(#values),*] };
    let (extra, ret, body) = match &method.kind {
        Kind::Vec => (
            quote! {},
            quote! { Vec<#entity> },
            quote! { self.inner.find_with(session, self.#query_field.bind(#args)?, &self.#hints_field, #name_str).await },
        ),
        Kind::Option => (
            quote! {},
            quote! { Option<#entity> },
            quote! { self.inner.find_one_with(session, self.#query_field.bind(#args)?, &self.#hints_field, #name_str).await },
        ),
        Kind::Page => (
            quote! { , request: &::datarepo_core::paging::PageRequest },
            quote! { ::datarepo_core::paging::Page<#entity> },
            quote! { self.inner.find_page_with(session, self.#query_field.bind(#args)?, request, &self.#hints_field, #name_str).await },
        ),
        Kind::Slice => (
            quote! { , request: &::datarepo_core::paging::PageRequest },
            quote! { ::datarepo_core::paging::Slice<#entity> },
            quote! { self.inner.find_slice_with(session, self.#query_field.bind(#args)?, request, &self.#hints_field, #name_str).await },
        ),
        Kind::Count => (
            quote! {},
            quote! { u64 },
            quote! { self.inner.count_with(session, &self.#query_field.bind_count(#args)?, #name_str).await },
        ),
        Kind::Exists => (
            quote! {},
            quote! { bool },
            quote! { self.inner.exists_with(session, &self.#query_field.bind_count(#args)?, #name_str).await },
        ),
        Kind::Delete => (
            quote! {},
            quote! { u64 },
            quote! { self.inner.delete_with(session, self.#query_field.bind(#args)?, #name_str).await },
        ),
        Kind::Projected(p) => (
            quote! {},
            quote! { Vec<#p> },
            quote! { self.inner.project_with::<E, #p>(session, self.#query_field.bind(#args)?, #name_str).await },
        ),
        Kind::Scalars(_) | Kind::Rows(_) | Kind::Modifying => unreachable!("rejected above"),
    };

    Ok(Generated {
        fields: vec![
            quote! { #query_field: ::datarepo_core::derived::DerivedQuery },
            quote! { #hints_field: ::datarepo_core::hints::QueryHints },
        ],
        inits: vec![
            quote! {
                #query_field: {
                    let q = ::datarepo_core::derived::DerivedQuery::parse_with(meta, #name_str)?;
                    q.expect_subject(&[::datarepo_core::derived::Subject::#subject])?;
                    q.expect_arity(#arity)?;
                    q
                }
            },
            quote! {
                #hints_field: {
                    let h = #hints;
                    h.validate(&meta)?;
                    h
                }
            },
        ],
        method: quote! {
            pub async fn #name<E: ::datarepo_core::engine::Engine>(
                &self,
                session: &mut ::datarepo_core::session::Session<E>,
                #(#names: #types),* #extra
            ) -> ::datarepo_core::RepoResult<#ret> {
                #body
            }
        },
    })
}

fn text_query(method: &Method, entity: &Type) -> syn::Result<Generated> {
    check_attrs(method, &["hints", "modifying"])?;
    let name = &method.name;
    let name_str = name.to_string();
    let text = method.text.as_ref().ok_or_else(|| {
        syn::Error::new(name.span(), "Query methods need query text: `name(args) -> Kind = \"select ...\"`")
    })?;
    let query_field = format_ident!("{}_query", name);
    let hints_field = format_ident!("{}_hints", name);
    let hints = parse_hints(&method.attrs)?;
    let options = parse_bulk_options(&method.attrs)?;
    let (names, types, values) = signature_parts(method);
    let arg_strs: Vec<String> = names.iter().map(|n| n.to_string()).collect();

    let expect = match &method.kind {
        Kind::Vec | Kind::Option | Kind::Page | Kind::Slice => quote! { Entities },
        Kind::Count | Kind::Exists => quote! { Count },
        Kind::Scalars(_) => quote! { Scalar },
        Kind::Rows(_) => quote! { Row },
        Kind::Modifying => quote! { Modifying },
        Kind::Delete | Kind::Projected(_) => {
            return Err(syn::Error::new(
                name.span(),
                "Delete and Projected<P> apply to derived finders; use Modifying or Rows<R> with query text",
            ))
        }
    };

    let (extra, ret, body) = match &method.kind {
        Kind::Vec => (
            quote! {},
            quote! { Vec<#entity> },
            quote! { self.inner.find_with(session, self.#query_field.bind_select(&params)?, &self.#hints_field, #name_str).await },
        ),
        Kind::Option => (
            quote! {},
            quote! { Option<#entity> },
            quote! { self.inner.find_one_with(session, self.#query_field.bind_select(&params)?, &self.#hints_field, #name_str).await },
        ),
        Kind::Page => (
            quote! { , request: &::datarepo_core::paging::PageRequest },
            quote! { ::datarepo_core::paging::Page<#entity> },
            quote! { self.inner.find_page_with(session, self.#query_field.bind_select(&params)?, request, &self.#hints_field, #name_str).await },
        ),
        Kind::Slice => (
            quote! { , request: &::datarepo_core::paging::PageRequest },
            quote! { ::datarepo_core::paging::Slice<#entity> },
            quote! { self.inner.find_slice_with(session, self.#query_field.bind_select(&params)?, request, &self.#hints_field, #name_str).await },
        ),
        Kind::Count => (
            quote! {},
            quote! { u64 },
            quote! { self.inner.count_with(session, &self.#query_field.bind_count(&params)?, #name_str).await },
        ),
        Kind::Exists => (
            quote! {},
            quote! { bool },
            quote! { self.inner.exists_with(session, &self.#query_field.bind_count(&params)?, #name_str).await },
        ),
        Kind::Scalars(v) => (
            quote! {},
            quote! { Vec<#v> },
            quote! { self.inner.values_with::<E, #v>(session, self.#query_field.bind_select(&params)?, #name_str).await },
        ),
        Kind::Rows(r) => (
            quote! {},
            quote! { Vec<#r> },
            quote! { self.inner.records_with::<E, #r>(session, self.#query_field.bind_select(&params)?, #name_str).await },
        ),
        Kind::Modifying => (
            quote! {},
            quote! { u64 },
            quote! { self.inner.modify_with(session, &self.#query_field, &params, #options, #name_str).await },
        ),
        Kind::Delete | Kind::Projected(_) => unreachable!("rejected above"),
    };

    Ok(Generated {
        fields: vec![
            quote! { #query_field: ::datarepo_core::ql::TextQuery },
            quote! { #hints_field: ::datarepo_core::hints::QueryHints },
        ],
        inits: vec![
            quote! {
                #query_field: {
                    let q = ::datarepo_core::ql::TextQuery::parse_with(meta, #text)?;
                    q.expect(::datarepo_core::ql::Expect::#expect)?;
                    q.check_arguments(&[#(#arg_strs),*])?;
                    q
                }
            },
            quote! {
                #hints_field: {
                    let h = #hints;
                    h.validate(&meta)?;
                    h
                }
            },
        ],
        method: quote! {
            pub async fn #name<E: ::datarepo_core::engine::Engine>(
                &self,
                session: &mut ::datarepo_core::session::Session<E>,
                #(#names: #types),* #extra
            ) -> ::datarepo_core::RepoResult<#ret> {
                let params = ::datarepo_core::query::Params::from_args(&[#(#arg_strs),*], vec![#(#values),*]);
                #body
            }
        },
    })
}

#[proc_macro_attribute]
pub fn repository(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as RepositoryArgs);
    let input_mod = parse_macro_input!(item as ItemMod);

    let mod_name = &input_mod.ident;
    let vis = &input_mod.vis;
    let entity_ty = &args.entity;

    // Build the path to the generated <Entity>RowAdapter type by replacing the
    // last path segment ident with "<Entity>RowAdapter".
    let Some(adapter_path_ts) = adapter_path(entity_ty) else {
        return syn::Error::new(entity_ty.span(), "`entity` must be a type path for repository macro")
            .to_compile_error()
            .into();
    };

    let mut generated = Vec::new();
    for method in &args.finders {
        match finder(method, entity_ty) {
            Ok(g) => generated.push(g),
            Err(e) => return e.to_compile_error().into(),
        }
    }
    for method in &args.queries {
        match text_query(method, entity_ty) {
            Ok(g) => generated.push(g),
            Err(e) => return e.to_compile_error().into(),
        }
    }
    let fields: Vec<_> = generated.iter().flat_map(|g| g.fields.iter()).collect();
    let inits: Vec<_> = generated.iter().flat_map(|g| g.inits.iter()).collect();
    let methods: Vec<_> = generated.iter().map(|g| &g.method).collect();

    let (custom_field, custom_init, custom_accessor) = match &args.custom {
        Some(custom) => (
            quote! { custom: #custom, },
            quote! { custom: <#custom as ::datarepo::RepositoryFragment>::build()?, },
            quote! {
                /// The hand-written fragment composed into this repository.
                pub fn custom(&self) -> &#custom {
                    &self.custom
                }
            },
        ),
        None => (quote! {}, quote! {}, quote! {}),
    };

    let key_ty = quote! { <#entity_ty as ::datarepo_core::Identifiable>::Key };

    let expanded = quote! {
        #vis mod #mod_name {
            #![allow(clippy::too_many_arguments)]
            use super::*;

            #[derive(Clone, Debug)]
            pub struct Repository {
                inner: ::datarepo::SimpleRepository<#entity_ty, #adapter_path_ts>,
                #custom_field
                #(#fields,)*
            }

            impl Repository {
                /// Parses every derived finder and query text; any invalid one fails here.
                pub fn new() -> ::datarepo_core::RepoResult<Self> {
                    #[allow(unused_variables)]
                    let meta = ::datarepo_core::EntityMeta::of::<#entity_ty>();
                    Ok(Self {
                        inner: ::datarepo::SimpleRepository::new(#adapter_path_ts),
                        #custom_init
                        #(#inits,)*
                    })
                }

                pub fn inner(&self) -> &::datarepo::SimpleRepository<#entity_ty, #adapter_path_ts> {
                    &self.inner
                }

                #custom_accessor

                #(#methods)*
            }

            #[::datarepo_core::async_trait]
            impl<E: ::datarepo_core::engine::Engine> ::datarepo_core::Repository<#entity_ty, E> for Repository {
                async fn save(&self, session: &mut ::datarepo_core::session::Session<E>, entity: #entity_ty) -> ::datarepo_core::RepoResult<#entity_ty> {
                    ::datarepo_core::Repository::<#entity_ty, E>::save(&self.inner, session, entity).await
                }

                async fn find_by_id(&self, session: &mut ::datarepo_core::session::Session<E>, id: &#key_ty) -> ::datarepo_core::RepoResult<Option<#entity_ty>> {
                    ::datarepo_core::Repository::<#entity_ty, E>::find_by_id(&self.inner, session, id).await
                }

                async fn find_all(&self, session: &mut ::datarepo_core::session::Session<E>) -> ::datarepo_core::RepoResult<Vec<#entity_ty>> {
                    ::datarepo_core::Repository::<#entity_ty, E>::find_all(&self.inner, session).await
                }

                async fn find_all_sorted(&self, session: &mut ::datarepo_core::session::Session<E>, sort: &::datarepo_core::paging::Sort) -> ::datarepo_core::RepoResult<Vec<#entity_ty>> {
                    ::datarepo_core::Repository::<#entity_ty, E>::find_all_sorted(&self.inner, session, sort).await
                }

                async fn find_all_by_id(&self, session: &mut ::datarepo_core::session::Session<E>, ids: &[#key_ty]) -> ::datarepo_core::RepoResult<Vec<#entity_ty>> {
                    ::datarepo_core::Repository::<#entity_ty, E>::find_all_by_id(&self.inner, session, ids).await
                }

                async fn find_by_field(&self, session: &mut ::datarepo_core::session::Session<E>, field_name: &str, value: ::datarepo_core::ParamValue) -> ::datarepo_core::RepoResult<Vec<#entity_ty>> {
                    ::datarepo_core::Repository::<#entity_ty, E>::find_by_field(&self.inner, session, field_name, value).await
                }

                async fn find_page(&self, session: &mut ::datarepo_core::session::Session<E>, request: &::datarepo_core::paging::PageRequest) -> ::datarepo_core::RepoResult<::datarepo_core::paging::Page<#entity_ty>> {
                    ::datarepo_core::Repository::<#entity_ty, E>::find_page(&self.inner, session, request).await
                }

                async fn count(&self, session: &mut ::datarepo_core::session::Session<E>) -> ::datarepo_core::RepoResult<u64> {
                    ::datarepo_core::Repository::<#entity_ty, E>::count(&self.inner, session).await
                }

                async fn delete(&self, session: &mut ::datarepo_core::session::Session<E>, entity: &#entity_ty) -> ::datarepo_core::RepoResult<()> {
                    ::datarepo_core::Repository::<#entity_ty, E>::delete(&self.inner, session, entity).await
                }

                async fn delete_by_id(&self, session: &mut ::datarepo_core::session::Session<E>, id: &#key_ty) -> ::datarepo_core::RepoResult<()> {
                    ::datarepo_core::Repository::<#entity_ty, E>::delete_by_id(&self.inner, session, id).await
                }

                async fn delete_all(&self, session: &mut ::datarepo_core::session::Session<E>) -> ::datarepo_core::RepoResult<()> {
                    ::datarepo_core::Repository::<#entity_ty, E>::delete_all(&self.inner, session).await
                }
            }

            #[::datarepo_core::async_trait]
            impl<E: ::datarepo_core::engine::Engine> ::datarepo_core::SpecificationExecutor<#entity_ty, E> for Repository {
                async fn find_all_spec(&self, session: &mut ::datarepo_core::session::Session<E>, spec: &::datarepo_core::specification::Specification<#entity_ty>) -> ::datarepo_core::RepoResult<Vec<#entity_ty>> {
                    ::datarepo_core::SpecificationExecutor::<#entity_ty, E>::find_all_spec(&self.inner, session, spec).await
                }

                async fn find_one_spec(&self, session: &mut ::datarepo_core::session::Session<E>, spec: &::datarepo_core::specification::Specification<#entity_ty>) -> ::datarepo_core::RepoResult<Option<#entity_ty>> {
                    ::datarepo_core::SpecificationExecutor::<#entity_ty, E>::find_one_spec(&self.inner, session, spec).await
                }

                async fn find_page_spec(&self, session: &mut ::datarepo_core::session::Session<E>, spec: &::datarepo_core::specification::Specification<#entity_ty>, request: &::datarepo_core::paging::PageRequest) -> ::datarepo_core::RepoResult<::datarepo_core::paging::Page<#entity_ty>> {
                    ::datarepo_core::SpecificationExecutor::<#entity_ty, E>::find_page_spec(&self.inner, session, spec, request).await
                }

                async fn count_spec(&self, session: &mut ::datarepo_core::session::Session<E>, spec: &::datarepo_core::specification::Specification<#entity_ty>) -> ::datarepo_core::RepoResult<u64> {
                    ::datarepo_core::SpecificationExecutor::<#entity_ty, E>::count_spec(&self.inner, session, spec).await
                }
            }
        }
    };

    TokenStream::from(expanded)
}
