// ui.rs

use crate::bridge::StatsSnapshot;
use crate::scheduler::Scheduler;
use crossbeam::channel::{unbounded, Receiver};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, warn};
use std::io::{self, BufRead};

/// Commands typed on stdin while the bridge runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiCommand {
    Quit,
    ShowStats,
}

pub fn map_input_line(line: &str) -> Option<UiCommand> {
    match line.trim() {
        "" | "q" | "Q" | "quit" => Some(UiCommand::Quit),
        "s" | "S" | "stats" => Some(UiCommand::ShowStats),
        _ => None,
    }
}

/// Forwards stdin commands on a channel until stdin closes.
///
/// End of input counts as [`UiCommand::Quit`].
pub fn spawn_input_listener<S: Scheduler>(scheduler: &S) -> io::Result<Receiver<UiCommand>> {
    let (tx, rx) = unbounded();
    scheduler.spawn("umpbridge-stdin", move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match map_input_line(&line) {
                Some(command) => {
                    if tx.send(command).is_err() {
                        return;
                    }
                }
                None => debug!("Ignoring input {:?}", line),
            }
        }
        let _ = tx.send(UiCommand::Quit);
    })?;
    Ok(rx)
}

pub fn format_status(running: bool, stats: &StatsSnapshot, uptime_secs: i64) -> String {
    let state = if running { "forwarding" } else { "stalled" };
    format!(
        "{} {:02}:{:02}:{:02} | to network {} | to device {} | filtered {} | dropped {} | partial {}",
        state,
        uptime_secs / 3600,
        (uptime_secs / 60) % 60,
        uptime_secs % 60,
        stats.to_network,
        stats.to_device,
        stats.filtered,
        stats.dropped,
        stats.partial_writes
    )
}

fn create_status_spinner(prefix: String) -> ProgressBar {
    let pb = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
    let style = ProgressStyle::default_spinner()
        .template("{prefix:.bold.dim} {spinner} {wide_msg}")
        .unwrap_or_else(|e| {
            warn!("Invalid spinner template: {}", e);
            ProgressStyle::default_spinner()
        });
    pb.set_style(style);
    pb.set_prefix(prefix);
    pb
}

/// Live status line shown while the bridge runs
pub struct StatusDisplay {
    spinner: ProgressBar,
}

impl StatusDisplay {
    pub fn new(endpoint_name: &str, destination: &str) -> Self {
        Self {
            spinner: create_status_spinner(format!("{} <-> {}", endpoint_name, destination)),
        }
    }

    pub fn refresh(&self, running: bool, stats: &StatsSnapshot, uptime_secs: i64) {
        self.spinner
            .set_message(format_status(running, stats, uptime_secs));
        self.spinner.tick();
    }

    /// Prints a line above the status without disturbing it.
    pub fn println(&self, line: impl AsRef<str>) {
        self.spinner.println(line);
    }

    pub fn finish(&self, message: &str) {
        self.spinner.finish_with_message(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_input_line() {
        assert_eq!(map_input_line("q"), Some(UiCommand::Quit));
        assert_eq!(map_input_line("  \n"), Some(UiCommand::Quit));
        assert_eq!(map_input_line("stats"), Some(UiCommand::ShowStats));
        assert_eq!(map_input_line("x"), None);
    }

    #[test]
    fn test_format_status() {
        let stats = StatsSnapshot {
            to_network: 3,
            to_device: 2,
            filtered: 1,
            dropped: 0,
            partial_writes: 0,
        };
        assert_eq!(
            format_status(true, &stats, 3725),
            "forwarding 01:02:05 | to network 3 | to device 2 | filtered 1 | dropped 0 | partial 0"
        );
        assert!(format_status(false, &stats, 0).starts_with("stalled 00:00:00"));
    }
}
