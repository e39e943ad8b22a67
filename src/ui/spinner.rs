use std::future::Future;
use std::time::{Duration, Instant};

use super::progress::spinner_bar;

const MIN_SPINNER_DURATION: Duration = Duration::from_millis(400);

/// Run `fut` behind a spinner on stderr. Hidden when stderr is not a
/// terminal or `quiet` is set (JSON output).
pub async fn with_spinner<T, F: Future<Output = T>>(message: &str, quiet: bool, fut: F) -> T {
    let spinner = spinner_bar(message, quiet);
    if spinner.is_hidden() {
        return fut.await;
    }

    let start = Instant::now();
    let result = fut.await;

    // keep it on screen long enough to read
    let elapsed = start.elapsed();
    if elapsed < MIN_SPINNER_DURATION {
        tokio::time::sleep(MIN_SPINNER_DURATION - elapsed).await;
    }

    spinner.finish_and_clear();
    result
}
