
use proc_macro::TokenStream;

/// Runs an `async fn(Harness)` integration test once per RNG seed, on a single threaded runtime with a paused clock.
///
/// Set `CCQ_TEST_RNG_SEED` to run a single seed, or `CCQ_TEST_SAMPLES` to run seeds `0..n`.
#[proc_macro_attribute]
pub fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    test::test_macro(args.into(), item.into()).into()
}
