extern crate proc_macro;

use proc_macro2::{Span, TokenStream};
use quote::quote;
use syn::{
    Ident, ItemFn, LitStr, Stmt, Token,
    parse::{Parse, ParseStream},
    parse_macro_input, parse_quote,
    punctuated::Punctuated,
};

mod keywords {
    syn::custom_keyword!(timing);
    syn::custom_keyword!(precision);
    syn::custom_keyword!(instrument);
}

/// Unit the elapsed time is reported in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Nanos,
    Micros,
    Millis,
    Seconds,
}

impl Unit {
    fn parse_name(name: &LitStr) -> syn::Result<Self> {
        match name.value().as_str() {
            "ns" | "nanos" | "nanoseconds" => Ok(Self::Nanos),
            "us" | "micros" | "microseconds" => Ok(Self::Micros),
            "ms" | "millis" | "milliseconds" => Ok(Self::Millis),
            "s" | "secs" | "seconds" => Ok(Self::Seconds),
            other => Err(syn::Error::new(
                name.span(),
                format!("unknown precision `{other}`, expected one of ns, us, ms, s"),
            )),
        }
    }

    /// Field name of the exit event and the expression computing it from `elapsed`
    fn field(self) -> (Ident, syn::Expr) {
        let (name, value): (&str, syn::Expr) = match self {
            Self::Nanos => ("elapsed_ns", parse_quote!(elapsed.as_nanos())),
            Self::Micros => ("elapsed_us", parse_quote!(elapsed.as_micros())),
            Self::Millis => ("elapsed_ms", parse_quote!(elapsed.as_millis())),
            Self::Seconds => ("elapsed_s", parse_quote!(elapsed.as_secs_f64())),
        };

        (Ident::new(name, Span::call_site()), value)
    }
}

enum Argument {
    /// `timing` or `timing(precision = "..")`
    Timing(Unit),
    /// `instrument(..)`, forwarded verbatim
    Instrument(TokenStream),
}

impl Parse for Argument {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let lookahead = input.lookahead1();

        if lookahead.peek(keywords::timing) {
            input.parse::<keywords::timing>()?;
            if !input.peek(syn::token::Paren) {
                return Ok(Self::Timing(Unit::Nanos));
            }

            let content;
            syn::parenthesized!(content in input);
            content.parse::<keywords::precision>()?;
            content.parse::<Token![=]>()?;
            Ok(Self::Timing(Unit::parse_name(&content.parse()?)?))
        } else if lookahead.peek(keywords::instrument) {
            input.parse::<keywords::instrument>()?;
            if !input.peek(syn::token::Paren) {
                return Ok(Self::Instrument(TokenStream::new()));
            }

            let content;
            syn::parenthesized!(content in input);
            Ok(Self::Instrument(content.parse()?))
        } else {
            Err(lookahead.error())
        }
    }
}

#[derive(Default)]
struct Arguments {
    timing: Option<Unit>,
    instrument: Option<TokenStream>,
}

impl Parse for Arguments {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut arguments = Self::default();

        for argument in Punctuated::<Argument, Token![,]>::parse_terminated(input)? {
            match argument {
                Argument::Timing(_) if arguments.timing.is_some() => {
                    return Err(input.error("`timing` given more than once"));
                }
                Argument::Instrument(_) if arguments.instrument.is_some() => {
                    return Err(input.error("`instrument` given more than once"));
                }
                Argument::Timing(unit) => arguments.timing = Some(unit),
                Argument::Instrument(tokens) => arguments.instrument = Some(tokens),
            }
        }

        Ok(arguments)
    }
}

/// Emits structured `trace` events when the attributed function is entered
/// and when it returns.
///
/// ```ignore
/// #[traced(instrument(level = tracing::Level::DEBUG, skip_all), timing(precision = "ms"))]
/// async fn dispatch(&self) { .. }
/// ```
///
/// The exit event carries `function` and, with `timing`, an `elapsed_<unit>`
/// field. It is emitted from a drop guard, so early returns, `?` and
/// cancelled futures are all covered. `instrument(..)` is forwarded to
/// `#[tracing::instrument]`.
///
/// # Panics
///
/// When applied to anything other than a function.
#[proc_macro_attribute]
pub fn traced(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let arguments = parse_macro_input!(args as Arguments);
    let mut item_fn = parse_macro_input!(item as ItemFn);

    item_fn
        .attrs
        .push(parse_quote!(#[allow(clippy::items_after_statements)]));

    if let Some(forwarded) = arguments.instrument {
        item_fn
            .attrs
            .push(parse_quote!(#[tracing::instrument(#forwarded)]));
    }

    let function = item_fn.sig.ident.to_string();
    let exit = arguments.timing.map_or_else(
        || quote!(tracing::trace!(function = #function, "exit");),
        |unit| {
            let (field, value) = unit.field();
            quote! {
                let elapsed = self.started.elapsed();
                tracing::trace!(function = #function, #field = #value, "exit");
            }
        },
    );

    let guard: Vec<Stmt> = parse_quote! {
        struct __TracedGuard {
            #[allow(dead_code)]
            started: std::time::Instant,
        }

        impl std::ops::Drop for __TracedGuard {
            fn drop(&mut self) {
                #exit
            }
        }

        tracing::trace!(function = #function, "enter");
        let __traced_guard = __TracedGuard {
            started: std::time::Instant::now(),
        };
    };

    let body = std::mem::take(&mut item_fn.block.stmts);
    item_fn.block.stmts = guard.into_iter().chain(body).collect();

    proc_macro::TokenStream::from(quote!(#item_fn))
}
