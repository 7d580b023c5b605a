use std::{thread, time::Duration};

use anyhow::{anyhow, Result};
use tether::{
    dispatch::Looper,
    futures::call::{Callback, Response},
    task::{AsyncScope, Executor, ResumptionContext},
};

fn after<T: Send + 'static>(delay: Duration, value: T) -> impl FnOnce(Callback<T>) + Send {
    move |cb| {
        thread::spawn(move || {
            thread::sleep(delay);
            let _ = cb.on_response(Response::ok(value));
        });
    }
}

async fn greet(scope: &AsyncScope, words: [&'static str; 3]) -> tether::Result<()> {
    for (i, word) in words.into_iter().enumerate() {
        let delay = Duration::from_millis(500 * (i as u64 + 1));
        let word = scope.await_call(|| after(delay, word)).await?;

        println!(
            "{word} ({} on {})",
            scope.context().name(),
            thread::current().name().unwrap_or("<unnamed>")
        );
    }

    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let (handler, looper) = Looper::spawn("ui")?;
    let executor = Executor::new();

    let upper = executor.run_async(
        ResumptionContext::new(handler.clone()).with_name("upper"),
        |scope| async move { greet(&scope, ["Hello A!", "Hello B!", "Hello C!"]).await },
    );

    let lower = executor.run_async(
        ResumptionContext::new(handler.clone()).with_name("lower"),
        |scope| async move { greet(&scope, ["Hello a!", "Hello b!", "Hello c!"]).await },
    );

    upper.join()?;
    lower.join()?;

    handler.quit();
    looper
        .join()
        .map_err(|_| anyhow!("looper thread panicked"))?;

    Ok(())
}
