use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DataStruct, DeriveInput, Fields, Type};

/// Derives `changed_fields()` for a struct of optional values.
///
/// Every `Option<_>` field holding `Some` is reported by name, in declaration order.
/// Non-optional fields (ids, keys) are never reported.
#[proc_macro_derive(ChangedFields)]
pub fn changed_fields(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let struct_name = input.ident;

    let Data::Struct(DataStruct { fields: Fields::Named(fields), .. }) = input.data else {
        return syn::Error::new_spanned(struct_name, "ChangedFields supports structs with named fields only")
            .to_compile_error()
            .into();
    };

    let pushes = fields.named.iter().filter_map(|field| {
        let field_name = field.ident.as_ref()?;
        let Type::Path(type_path) = &field.ty else {
            return None;
        };
        if type_path.path.segments.last()?.ident != "Option" {
            return None;
        }
        Some(quote! {
            if self.#field_name.is_some() {
                changed.push(stringify!(#field_name));
            }
        })
    });

    let expanded = quote! {
        impl #struct_name {
            pub fn changed_fields(&self) -> Vec<&'static str> {
                let mut changed = Vec::new();
                #(#pushes)*
                changed
            }
        }
    };
    TokenStream::from(expanded)
}
