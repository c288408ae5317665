#![allow(clippy::needless_doctest_main)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]

//! Entry-point macros for weft (structure borrowed from tokio-macros).

mod entry;
mod parse;

/// Marks an async function to be executed by the runtime. This macro sets up
/// a `Runtime` without requiring the user to touch `Runtime` or `Builder`
/// directly.
///
/// The `worker_threads` option configures the number of worker threads, and
/// defaults to the number of CPUs on the system.
///
/// # Usage
///
/// ```no_run
/// #[weft::main(worker_threads = 4)]
/// async fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// Equivalent code not using `#[weft::main]`
///
/// ```no_run
/// fn main() {
///     weft::runtime::Builder::new()
///         .worker_threads(4)
///         .try_build()
///         .expect("failed building the runtime")
///         .block_on(async {
///             println!("Hello world");
///         })
///         .expect("entry future deadlocked")
/// }
/// ```
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::main(args.into(), item.into()).into()
}

/// Marks an async function to be executed by the runtime, suitable for test
/// environments. Each test gets a fresh pool, torn down before the test
/// returns.
///
/// # Usage
///
/// ```no_run
/// #[weft::test(worker_threads = 2)]
/// async fn my_test() {
///     assert!(true);
/// }
/// ```
///
/// Equivalent code not using `#[weft::test]`
///
/// ```no_run
/// #[test]
/// fn my_test() {
///     weft::runtime::Builder::new()
///         .worker_threads(2)
///         .try_build()
///         .expect("failed building the runtime")
///         .block_on(async {
///             assert!(true);
///         })
///         .expect("entry future deadlocked")
/// }
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
