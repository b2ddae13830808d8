//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[tokio_timeout_test]` runs an async body on a fresh current-thread runtime,
//! `#[timeout]` runs a synchronous body on a watchdog thread. Both accept an
//! optional timeout in seconds (default 60). The async form also accepts
//! `paused`, which starts the runtime with tokio's clock frozen so timer-driven
//! code advances deterministically; the consuming crate needs tokio's
//! `test-util` feature for that.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream, Parser};
use syn::punctuated::Punctuated;
use syn::{Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

enum TimeoutArg {
    Secs(LitInt),
    Paused(Ident),
}

impl Parse for TimeoutArg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            return input.parse().map(TimeoutArg::Secs);
        }
        let ident: Ident = input.parse()?;
        if ident == "paused" {
            Ok(TimeoutArg::Paused(ident))
        } else {
            Err(syn::Error::new_spanned(
                ident,
                "expected a timeout in seconds or `paused`",
            ))
        }
    }
}

struct TimeoutOptions {
    secs: u64,
    paused: bool,
}

fn parse_options(attr: TokenStream, allow_paused: bool) -> syn::Result<TimeoutOptions> {
    let mut options = TimeoutOptions {
        secs: DEFAULT_TIMEOUT_SECS,
        paused: false,
    };
    let args = Punctuated::<TimeoutArg, Token![,]>::parse_terminated.parse(attr)?;
    for arg in args {
        match arg {
            TimeoutArg::Secs(lit) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
                options.secs = secs;
            }
            TimeoutArg::Paused(ident) if !allow_paused => {
                return Err(syn::Error::new_spanned(
                    ident,
                    "`paused` only applies to async tests",
                ));
            }
            TimeoutArg::Paused(_) => options.paused = true,
        }
    }
    Ok(options)
}

/// Wraps `body` (an expression producing the test's result) in a watchdog thread.
fn watchdog(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_secs(#secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, true) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = strip_attrs(attrs, is_tokio_test_attribute);
    let secs = options.secs;
    // With the clock paused, virtual time says nothing about a hang; only the
    // watchdog thread's wall-clock limit applies.
    let (start_paused, run_body) = if options.paused {
        (quote! { .start_paused(true) }, quote! { async move #block.await; })
    } else {
        (
            quote! {},
            quote! {
                tokio::time::timeout(timeout_duration, async move #block)
                    .await
                    .expect("test timed out");
            },
        )
    };
    let body = watchdog(
        secs,
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                #start_paused
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                #run_body
            });
        },
    );

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, false) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_attrs(attrs, is_test_attribute);
    let body = watchdog(options.secs, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}

fn strip_attrs(attrs: Vec<Attribute>, reject: fn(&Attribute) -> bool) -> Vec<Attribute> {
    attrs.into_iter().filter(|attr| !reject(attr)).collect()
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
