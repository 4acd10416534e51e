use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_macro_input, FnArg, GenericArgument, ItemFn, LitStr, Pat, PathArguments, ReturnType, Type};

/// Declares an atom from a plain function.
///
/// ```ignore
/// #[atom]
/// fn double(load: i64) -> i64 {
///     load * 2
/// }
///
/// workflow.register(double_atom());
/// ```
///
/// Every parameter names the atom it depends on and is deserialized from that
/// atom's value. The function may return a plain serializable value or a
/// `Result`. The generated `<name>_atom()` constructor registers the atom
/// under the function name, or under `#[atom(name = "...")]` when given.
#[proc_macro_attribute]
pub fn atom(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);

    let mut atom_name: Option<LitStr> = None;
    let attr_parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("name") {
            atom_name = Some(meta.value()?.parse()?);
            Ok(())
        } else {
            Err(meta.error("unsupported atom attribute, expected `name`"))
        }
    });
    parse_macro_input!(attr with attr_parser);

    let atom_name = atom_name
        .map(|lit| lit.value())
        .unwrap_or_else(|| input.sig.ident.to_string());

    expand(&input, &atom_name)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(input: &ItemFn, atom_name: &str) -> syn::Result<TokenStream2> {
    let fn_name = &input.sig.ident;
    let vis = &input.vis;
    let constructor = format_ident!("{}_atom", fn_name);

    if input.sig.asyncness.is_some() {
        return Err(syn::Error::new_spanned(
            &input.sig,
            "atoms must be synchronous functions",
        ));
    }

    let mut params = Vec::new();
    let mut bindings = Vec::new();
    let mut idents = Vec::new();
    for arg in &input.sig.inputs {
        let FnArg::Typed(pat_type) = arg else {
            return Err(syn::Error::new_spanned(arg, "atoms cannot take `self`"));
        };
        let Pat::Ident(pat_ident) = &*pat_type.pat else {
            return Err(syn::Error::new_spanned(
                &pat_type.pat,
                "atom parameters must be plain identifiers",
            ));
        };

        let ident = &pat_ident.ident;
        let param_name = ident.to_string();
        let param_name = param_name.trim_start_matches("r#").to_string();
        let ty = &pat_type.ty;
        bindings.push(quote! {
            let #ident: #ty = ctx.arg_as(#param_name)?;
        });
        params.push(param_name);
        idents.push(ident.clone());
    }

    let call = if returns_result(&input.sig.output) {
        quote! { #fn_name(#(#idents),*)? }
    } else {
        quote! { #fn_name(#(#idents),*) }
    };

    let ctx = if idents.is_empty() {
        format_ident!("_ctx")
    } else {
        format_ident!("ctx")
    };

    let doc = format!("Atom `{}` backed by [`{}`].", atom_name, fn_name);
    let expanded = quote! {
        #input

        #[doc = #doc]
        #vis fn #constructor() -> ::atomflow::Atom {
            const PARAMS: &[&str] = &[#(#params),*];
            ::atomflow::Atom::new(#atom_name, |#ctx| {
                #(#bindings)*
                let out = #call;
                Ok(::atomflow::AtomValue::serialize(&out)?)
            })
            .with_params(PARAMS.iter().copied())
        }
    };

    Ok(expanded)
}

fn returns_result(output: &ReturnType) -> bool {
    let ReturnType::Type(_, ty) = output else {
        return false;
    };
    let Type::Path(type_path) = &**ty else {
        return false;
    };
    type_path.path.segments.last().is_some_and(|segment| {
        segment.ident == "Result"
            && match &segment.arguments {
                PathArguments::AngleBracketed(args) => args
                    .args
                    .iter()
                    .any(|arg| matches!(arg, GenericArgument::Type(_))),
                _ => false,
            }
    })
}
