use proc_macro2::TokenStream;
use quote::quote;
use syn::{
    parse_macro_input, parse_quote, spanned::Spanned, visit_mut::VisitMut, AttributeArgs,
    Error, Expr, FnArg, Ident, ItemFn, NestedMeta, Pat, Result, ReturnType, Type,
};

#[proc_macro_attribute]
pub fn ioctl_module(
    attrs: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let args = parse_macro_input!(attrs as AttributeArgs);
    let input = parse_macro_input!(item as ItemFn);
    expand(args, input)
        .unwrap_or_else(Error::into_compile_error)
        .into()
}

/// Rewrites every `real!()` into `<call>.pass_through()`.
struct RealCalls<'a> {
    call: &'a Ident,
    errors: Vec<Error>,
}

impl VisitMut for RealCalls<'_> {
    fn visit_expr_mut(&mut self, expr: &mut Expr) {
        if let Expr::Macro(expr_macro) = expr {
            let mac = &expr_macro.mac;
            if mac.path.is_ident("real") {
                if !mac.tokens.is_empty() {
                    self.errors.push(Error::new(
                        mac.tokens.span(),
                        "real!() takes no arguments, the intercepted call is passed through as is",
                    ));
                }
                let call = self.call;
                *expr = parse_quote!(#call.pass_through());
                return;
            }
        }

        syn::visit_mut::visit_expr_mut(self, expr);
    }
}

fn expand(args: Vec<NestedMeta>, mut input: ItemFn) -> Result<TokenStream> {
    if let Some(arg) = args.first() {
        return Err(Error::new(arg.span(), "#[ioctl_module] takes no arguments"));
    }

    let sig = &input.sig;
    if sig.inputs.len() != 3 {
        return Err(Error::new(
            sig.inputs.span(),
            "expected fn(ctx: &Ctx, call: &IoctlCall<'_>, dev: Dev) -> c_long",
        ));
    }
    if let ReturnType::Default = sig.output {
        return Err(Error::new(sig.span(), "an ioctl module must return c_long"));
    }

    let typed = sig
        .inputs
        .iter()
        .map(|a| match a {
            FnArg::Typed(t) => Ok(t),
            FnArg::Receiver(r) => Err(Error::new(r.span(), "an ioctl module can't take self")),
        })
        .collect::<Result<Vec<_>>>()?;

    // fn(ctx: &Ctx, ...), the module is generic over Ctx
    let ctx_ty = match &*typed[0].ty {
        Type::Reference(r) if r.mutability.is_none() => r.elem.clone(),
        ty => return Err(Error::new(ty.span(), "the context must be taken as &Ctx")),
    };

    // real!() needs a name for the intercepted call
    let call = match &*typed[1].pat {
        Pat::Ident(pat_ident) => pat_ident.ident.clone(),
        pat => {
            return Err(Error::new(
                pat.span(),
                "the call argument must be a plain identifier",
            ))
        }
    };

    let mut real_calls = RealCalls {
        call: &call,
        errors: Vec::new(),
    };
    real_calls.visit_block_mut(&mut input.block);
    if let Some(mut err) = real_calls.errors.pop() {
        for e in real_calls.errors {
            err.combine(e);
        }
        return Err(err);
    }

    // build the handler function, signature is the original one, named
    // fn ioctl_{origin_name}
    let attrs = &input.attrs;
    let vis = &input.vis;
    let ident = &input.sig.ident;
    let ident_str = ident.to_string();
    let mut sig_ioctl = input.sig.clone();
    sig_ioctl.ident = Ident::new(&format!("ioctl_{}", ident), ident.span());
    let ident_ioctl = &sig_ioctl.ident;
    let block = &input.block;

    Ok(quote!(
        #(#attrs)*
        #vis #sig_ioctl #block

        #[allow(non_upper_case_globals)]
        #vis static #ident: ioctl_hook::Module<#ctx_ty> = ioctl_hook::Module {
            name: #ident_str,
            ioctl: Some(#ident_ioctl),
        };
    ))
}
