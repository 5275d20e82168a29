use std::io::Write;
use std::sync::Once;

use chrono::Utc;

use crate::config::{LogFormat, LoggingConfig};

static INIT: Once = Once::new();

/// Installs the global logger once. `RUST_LOG` wins over the configured
/// level when set.
pub fn init(config: &LoggingConfig) {
    INIT.call_once(|| {
        let format = config.format;
        let mut builder = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(config.level.as_str()),
        );

        builder.format(move |buf, record| {
            let ts = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            match format {
                LogFormat::Json => {
                    let line = serde_json::json!({
                        "ts": ts,
                        "level": record.level().to_string(),
                        "target": record.target(),
                        "msg": record.args().to_string(),
                    });
                    writeln!(buf, "{}", line)
                }
                LogFormat::Text => writeln!(
                    buf,
                    "{} {:<5} {} {}",
                    ts,
                    record.level(),
                    record.target(),
                    record.args()
                ),
            }
        });
        builder.target(env_logger::Target::Stderr);

        if builder.try_init().is_err() {
            log::debug!("Logger already installed; keeping it");
        }
    });
}
