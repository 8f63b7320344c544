use std::{net::SocketAddr, path::PathBuf};

use clap::{Parser, Subcommand};
use tapedeck::{config::Config, logging, proxy};

#[derive(Debug, Parser)]
#[command(name = "tapedeck")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the record/replay proxy.
    Serve {
        /// Path to the config TOML.
        #[arg(long)]
        config: PathBuf,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_level } => {
            let config = Config::from_path(&config)?;
            let log_settings = logging::init(&config, log_level.as_deref())?;
            tracing::debug!(
                level = %log_settings.level,
                format = log_settings.format.as_str(),
                "logging initialized"
            );
            let proxy = proxy::serve_config(&config).await?;
            eprintln!("{}", startup_summary(&config, proxy.listen_addr));
            tokio::signal::ctrl_c().await?;
            let stats = proxy.engine().stats();
            tracing::info!(
                replayed = stats.replayed,
                recorded = stats.recorded,
                failed = stats.failed,
                upstream_requests = stats.upstream_requests,
                "shutting down"
            );
            proxy.shutdown().await;
        }
    }

    Ok(())
}

fn startup_summary(config: &Config, listen_addr: SocketAddr) -> String {
    let tls_summary = match config.upstream.tls.as_ref() {
        Some(tls) => format!(
            "client_cert={},client_key={},ca_cert={},insecure_skip_verify={}",
            tls.client_cert
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "none".to_owned()),
            redact_if_present(tls.client_key.as_ref()),
            tls.ca_cert
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "none".to_owned()),
            tls.insecure_skip_verify
        ),
        None => "default".to_owned(),
    };

    format!(
        "startup config: proxy_listen={}, upstream={}, fixture_dir={}, normalize={}, scrub={}, upstream_tls={}",
        listen_addr,
        config.upstream.url,
        config.fixture_dir().display(),
        config
            .normalize
            .as_ref()
            .map_or(0, |normalize| normalize.remove_headers.len()),
        config.scrub.as_ref().map_or(0, |scrub| scrub.headers.len()),
        tls_summary
    )
}

fn redact_if_present(value: Option<&PathBuf>) -> &'static str {
    if value.is_some() {
        "[REDACTED]"
    } else {
        "none"
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;
    use tapedeck::config::Config;

    use super::{Cli, Command, redact_if_present, startup_summary};

    #[test]
    fn serve_requires_config_flag() {
        assert!(Cli::try_parse_from(["tapedeck", "serve"]).is_err());
    }

    #[test]
    fn serve_parses_config_and_log_level() {
        let cli = Cli::try_parse_from([
            "tapedeck",
            "serve",
            "--config",
            "tapedeck.toml",
            "--log-level",
            "debug",
        ])
        .expect("cli parse should succeed");
        let Command::Serve { config, log_level } = cli.command;

        assert_eq!(config, PathBuf::from("tapedeck.toml"));
        assert_eq!(log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn startup_summary_redacts_client_key_path() {
        let config = Config::from_toml_str(
            r#"
[proxy]
listen = "127.0.0.1:0"

[fixtures]
dir = "/tmp/fixtures"

[upstream]
url = "https://localhost:1337"

[upstream.tls]
client_cert = "/etc/tapedeck/client.pem"
client_key = "/etc/tapedeck/client-key.pem"

[[scrub.headers]]
name = "authorization"
pattern = '^(Basic \w)[\w=]+$'
replacement = "$1"
"#,
        )
        .expect("config should parse");

        let summary = startup_summary(&config, "127.0.0.1:1338".parse().unwrap());

        assert!(summary.contains("proxy_listen=127.0.0.1:1338"), "{summary}");
        assert!(summary.contains("client_cert=/etc/tapedeck/client.pem"), "{summary}");
        assert!(summary.contains("client_key=[REDACTED]"), "{summary}");
        assert!(!summary.contains("client-key.pem"), "{summary}");
        assert!(summary.contains("scrub=1"), "{summary}");
    }

    #[test]
    fn redact_if_present_only_hides_configured_values() {
        assert_eq!(redact_if_present(None), "none");
        assert_eq!(
            redact_if_present(Some(&PathBuf::from("key.pem"))),
            "[REDACTED]"
        );
    }
}
