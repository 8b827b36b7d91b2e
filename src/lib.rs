pub mod data;
pub mod error;
pub mod pipeline;
pub mod trainers;
pub mod watermark;

// Re-export common types
pub use error::{DatasetError, WatermarkError};
pub use trainers::{load_hyperparameters, train_from_args, Hyperparameters, TrainArgs};

pub mod logging {
    use env_logger::{Builder, Env};
    use std::io::Write;

    /// Timestamped logger, `info` unless `RUST_LOG` says otherwise.
    pub fn init_logger() {
        Builder::from_env(Env::default().default_filter_or("info"))
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .init();
    }
}
