mod app;
mod cli;
mod config;
mod paths;

use anyhow::Context;
use clap::Parser;
use llm_bridge::{ChatStream, StreamStats};
use std::io::Write;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    let config_path = paths::config_path()?;
    let cfg = config::Config::load_optional(&config_path)?;
    tracing::debug!(?config_path, ?cfg, "resolved config");

    let provider_name = args
        .provider
        .clone()
        .or_else(|| cfg.as_ref().and_then(|c| c.provider.clone()))
        .unwrap_or_else(|| app::DEFAULT_PROVIDER.to_string());

    let http = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    let client = app::build_client(&http, cfg.as_ref(), &provider_name)?;
    let req = app::build_request(&args, cfg.as_ref(), &provider_name)?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    if args.no_stream {
        let resp = client
            .chat(&cancel, req)
            .await
            .context("chat request failed")?;
        println!("{}", resp.content);
        for call in &resp.tool_calls {
            println!("[tool call] {}({})", call.name, call.arguments);
        }
        eprintln!(
            "latency={}ms tokens={}/{}/{}",
            resp.latency.as_millis(),
            resp.usage.prompt_tokens,
            resp.usage.completion_tokens,
            resp.usage.total_tokens
        );
        return Ok(());
    }

    let mut stream = client
        .chat_stream(&cancel, req)
        .await
        .context("provider failed to start streaming")?;

    let mut out = std::io::stdout();
    let result = print_stream(stream.as_mut(), &mut out).await;
    stream.close();
    stream.finished().await;
    writeln!(out).ok();
    result.context("stream failed")?;

    for call in stream.tool_calls() {
        println!("[tool call] {}({})", call.name, call.arguments);
    }
    report(&stream.stats());
    Ok(())
}

async fn print_stream(
    stream: &mut dyn ChatStream,
    out: &mut impl Write,
) -> Result<(), llm_bridge::LlmError> {
    while let Some(text) = stream.recv().await? {
        write!(out, "{text}").ok();
        out.flush().ok();
    }
    Ok(())
}

fn report(stats: &StreamStats) {
    eprintln!(
        "ttft={}ms latency={}ms tokens={}/{}/{} local={} finish_reason={} response_type={:?}",
        stats.ttft.as_millis(),
        stats.total_latency.as_millis(),
        stats.usage.prompt_tokens,
        stats.usage.completion_tokens,
        stats.usage.total_tokens,
        stats.local_token_count,
        if stats.finish_reason.is_empty() {
            "-"
        } else {
            stats.finish_reason.as_str()
        },
        stats.response_type
    );
}
