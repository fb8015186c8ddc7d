// src/diagnostics.rs - Host section of the M122 report
use crate::channel::Channel;
use crate::job::JobSnapshot;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HostDiagnostics {
    pub version: &'static str,
    pub uptime: Duration,
    pub job: JobSnapshot,
    /// Codes still in flight, per channel with at least one.
    pub pending: Vec<(Channel, usize)>,
    /// Channels with an open upload and its file name if known.
    pub uploads: Vec<(Channel, Option<String>)>,
}

impl HostDiagnostics {
    pub fn collect(
        uptime: Duration,
        job: JobSnapshot,
        pending: impl Fn(Channel) -> usize,
        uploads: Vec<(Channel, Option<String>)>,
    ) -> Self {
        let pending = Channel::ALL
            .iter()
            .map(|&channel| (channel, pending(channel)))
            .filter(|(_, count)| *count > 0)
            .collect();
        Self {
            version: env!("CARGO_PKG_VERSION"),
            uptime,
            job,
            pending,
            uploads,
        }
    }
}

impl fmt::Display for HostDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.uptime.as_secs();
        writeln!(f, "=== Host ===")?;
        writeln!(f, "Version: gantry-host {}", self.version)?;
        writeln!(f, "Uptime: {}:{:02}:{:02}", seconds / 3600, seconds / 60 % 60, seconds % 60)?;
        match &self.job.file_name {
            Some(name) => writeln!(
                f,
                "Job: {} {} at byte {}",
                self.job.state.name(),
                name,
                self.job.positions[0]
            )?,
            None => writeln!(f, "Job: {}", self.job.state.name())?,
        }
        if self.job.secondary_running {
            writeln!(f, "Secondary feed at byte {}", self.job.positions[1])?;
        }

        if self.pending.is_empty() {
            writeln!(f, "Pending codes: none")?;
        } else {
            let pending: Vec<String> = self.pending.iter().map(|(channel, n)| format!("{} {}", channel, n)).collect();
            writeln!(f, "Pending codes: {}", pending.join(", "))?;
        }

        if self.uploads.is_empty() {
            write!(f, "Uploads: none")
        } else {
            let uploads: Vec<String> = self
                .uploads
                .iter()
                .map(|(channel, name)| match name {
                    Some(name) => format!("{} -> {}", channel, name),
                    None => format!("{} (busy)", channel),
                })
                .collect();
            write!(f, "Uploads: {}", uploads.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;

    #[test]
    fn report_lists_busy_channels_only() {
        let job = JobSnapshot {
            state: JobState::Processing,
            file_name: Some("0:/gcodes/a.g".to_string()),
            file_size: Some(100),
            positions: [42, 0],
            simulating: false,
            secondary_running: false,
        };
        let report = HostDiagnostics::collect(
            Duration::from_secs(3725),
            job,
            |channel| if channel == Channel::File { 3 } else { 0 },
            vec![(Channel::Usb, Some("0:/gcodes/up.g".to_string()))],
        )
        .to_string();
        assert!(report.starts_with("=== Host ===\n"));
        assert!(report.contains("Uptime: 1:02:05"));
        assert!(report.contains("Job: processing 0:/gcodes/a.g at byte 42"));
        assert!(report.contains(&format!("Pending codes: {} 3", Channel::File)));
        assert!(report.ends_with(&format!("Uploads: {} -> 0:/gcodes/up.g", Channel::Usb)));
    }
}
