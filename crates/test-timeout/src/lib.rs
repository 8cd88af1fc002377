//! `#[tokio_timeout_test(secs)]`: runs an async test body on its own Tokio
//! runtime and fails the test if it has not finished after `secs` seconds
//! (default 30). The body runs on a watchdog thread so even a test that
//! blocks the runtime outright is reported as a timeout.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = if attr.is_empty() {
        DEFAULT_TIMEOUT_SECS
    } else {
        let lit = parse_macro_input!(attr as LitInt);
        match lit.base10_parse::<u64>() {
            Ok(0) => {
                return syn::Error::new_spanned(lit, "timeout must be greater than zero")
                    .to_compile_error()
                    .into()
            }
            Ok(secs) => secs,
            Err(err) => return err.to_compile_error().into(),
        }
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test expects an async fn",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs.into_iter().filter(|a| !is_tokio_test(a)).collect();
    let name = sig.ident.to_string();

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = ::std::time::Duration::from_secs(#timeout_secs);
            let (done_tx, done_rx) = ::std::sync::mpsc::channel();
            let worker = ::std::thread::Builder::new()
                .name(::std::string::String::from(#name))
                .spawn(move || {
                    let outcome = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                        let runtime = ::tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                            .expect("failed to build test runtime");
                        runtime.block_on(async {
                            if ::tokio::time::timeout(limit, async move #block).await.is_err() {
                                panic!("test exceeded {:?}", limit);
                            }
                        });
                    }));
                    let _ = done_tx.send(outcome);
                })
                .expect("failed to spawn test thread");

            match done_rx.recv_timeout(limit + ::std::time::Duration::from_secs(1)) {
                Ok(Ok(())) => {
                    let _ = worker.join();
                }
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {:?} and never yielded", limit)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}

fn is_tokio_test(attr: &Attribute) -> bool {
    let segments: Vec<_> = attr.path().segments.iter().map(|s| s.ident.to_string()).collect();
    segments == ["tokio", "test"]
}
