use bdown::event::DownloadEvent;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc::UnboundedReceiver;

fn bar_style(total_known: bool) -> ProgressStyle {
    let template = if total_known {
        "{msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {prefix} ({eta})"
    } else {
        "{spinner} {msg} {bytes} {prefix}"
    };
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Draw pipeline events until the sender side is dropped.
pub async fn render(mut rx: UnboundedReceiver<DownloadEvent>) {
    let mut bar: Option<ProgressBar> = None;

    while let Some(event) = rx.recv().await {
        match event {
            DownloadEvent::Stage(stage) => {
                if let Some(bar) = bar.take() {
                    bar.finish();
                }
                tracing::debug!("Stage: {stage}");
            }
            DownloadEvent::Started { total_bytes, label } => {
                let new_bar = match total_bytes {
                    Some(total) => ProgressBar::new(total),
                    None => ProgressBar::new_spinner(),
                };
                new_bar.set_style(bar_style(total_bytes.is_some()));
                new_bar.set_message(label);
                if let Some(old) = bar.replace(new_bar) {
                    old.finish();
                }
            }
            DownloadEvent::Progress {
                bytes_read,
                speed_kbps,
                ..
            } => {
                if let Some(bar) = &bar {
                    bar.set_position(bytes_read);
                    bar.set_prefix(format!("{speed_kbps:.0} KiB/s"));
                }
            }
            DownloadEvent::Completed { label, path } => {
                if let Some(bar) = bar.take() {
                    bar.finish();
                }
                tracing::info!("{label} saved to {}", path.display());
            }
            DownloadEvent::Failed { kind, message } => {
                if let Some(bar) = bar.take() {
                    bar.abandon();
                }
                tracing::error!("[{kind}] {message}");
            }
        }
    }

    if let Some(bar) = bar {
        bar.abandon();
    }
}
