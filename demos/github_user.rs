use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tether::{
    dispatch::Looper,
    github::{GitHubApi, DEFAULT_BASE_URL},
    http::HttpClient,
    task::{Executor, ResumptionContext},
};

/// A tether GitHub lookup example.
///
/// The request runs on an HTTP worker thread; the code after `.await` runs
/// back on the main thread, which acts as the looper.
#[derive(Parser, Debug)]
struct Args {
    /// Login of the user to fetch.
    #[arg(default_value = "bennyhuo")]
    login: String,

    /// Base URL of the API. Only plain http:// endpoints are supported.
    #[arg(short, long, default_value = DEFAULT_BASE_URL)]
    base_url: String,
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    let client = HttpClient::builder(&args.base_url)
        .interceptor(|path, status| info!("request: {path} {status}"))
        .build()
        .with_context(|| format!("Could not configure a client for {}", args.base_url))?;
    let api = GitHubApi::new(client);

    let (looper, handler) = Looper::new();
    let executor = Executor::new();

    let task = {
        let login = args.login.clone();

        executor.run_async(
            ResumptionContext::new(handler).with_name("github-user"),
            move |scope| async move {
                let user = api.get_user(&scope, &login).await?;
                info!("{user:?}");
                Ok(user)
            },
        )
    };

    looper.run();

    let user = task
        .join()
        .with_context(|| format!("Could not fetch user {}", args.login))?;

    println!(
        "{} ({}): {}",
        user.name.as_deref().unwrap_or("<no name>"),
        user.id,
        user.url
    );

    Ok(())
}
