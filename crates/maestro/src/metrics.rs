//! Prometheus metrics in text exposition format.

use std::collections::BTreeMap;
use std::fmt::Write;

use maestro_core::{DaemonState, JobStatus};

use crate::snapshot::Snapshot;

const DAEMON_STATES: [DaemonState; 4] = [
    DaemonState::Disconnected,
    DaemonState::Run,
    DaemonState::AwaitingAnswer,
    DaemonState::Logged,
];

const JOB_STATUSES: [JobStatus; 6] = [
    JobStatus::Initial,
    JobStatus::Queued,
    JobStatus::Running,
    JobStatus::Finished,
    JobStatus::Failed,
    JobStatus::Canceled,
];

/// Format a snapshot as Prometheus text.
pub fn render(snapshot: &Snapshot) -> String {
    let mut output = String::new();

    render_daemons(snapshot, &mut output);
    render_jobs(snapshot, &mut output);
    render_clients(snapshot, &mut output);

    output
}

fn render_daemons(snapshot: &Snapshot, output: &mut String) {
    let mut by_state: BTreeMap<&str, u64> =
        DAEMON_STATES.iter().map(|s| (s.as_wire(), 0)).collect();
    for daemon in &snapshot.daemons {
        *by_state.entry(daemon.state.as_wire()).or_default() += 1;
    }
    let uncompleted: u64 = snapshot
        .daemons
        .iter()
        .map(|d| u64::from(d.uncompleted_tasks))
        .sum();

    writeln!(output, "# HELP maestro_daemons Number of known daemons by state").ok();
    writeln!(output, "# TYPE maestro_daemons gauge").ok();
    for (state, count) in &by_state {
        writeln!(output, "maestro_daemons{{state=\"{state}\"}} {count}").ok();
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP maestro_tasks_uncompleted Tasks running or queued on daemons"
    )
    .ok();
    writeln!(output, "# TYPE maestro_tasks_uncompleted gauge").ok();
    writeln!(output, "maestro_tasks_uncompleted {uncompleted}").ok();
}

fn render_jobs(snapshot: &Snapshot, output: &mut String) {
    let mut by_status: BTreeMap<&str, u64> =
        JOB_STATUSES.iter().map(|s| (s.as_wire(), 0)).collect();
    for job in &snapshot.jobs {
        *by_status.entry(job.status.as_wire()).or_default() += 1;
    }

    writeln!(output).ok();
    writeln!(output, "# HELP maestro_jobs Number of open jobs by status").ok();
    writeln!(output, "# TYPE maestro_jobs gauge").ok();
    for (status, count) in &by_status {
        writeln!(output, "maestro_jobs{{status=\"{status}\"}} {count}").ok();
    }
}

fn render_clients(snapshot: &Snapshot, output: &mut String) {
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP maestro_clients_connected Number of identified client sessions"
    )
    .ok();
    writeln!(output, "# TYPE maestro_clients_connected gauge").ok();
    writeln!(output, "maestro_clients_connected {}", snapshot.clients).ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{DaemonView, JobView};
    use maestro_core::{DaemonAddress, JobId};

    fn daemon(address: &str, state: DaemonState, uncompleted: u32) -> DaemonView {
        DaemonView {
            address: DaemonAddress::new(address),
            hostname: String::new(),
            state,
            autoconnect: true,
            tags: Vec::new(),
            uncompleted_tasks: uncompleted,
            error: None,
        }
    }

    #[test]
    fn test_render_empty_snapshot() {
        let output = render(&Snapshot::default());

        assert!(output.contains("maestro_daemons{state=\"logged\"} 0"));
        assert!(output.contains("maestro_daemons{state=\"awaiting_answer\"} 0"));
        assert!(output.contains("maestro_jobs{status=\"running\"} 0"));
        assert!(output.contains("maestro_clients_connected 0"));
        assert!(output.contains("maestro_tasks_uncompleted 0"));
    }

    #[test]
    fn test_render_counts() {
        let snapshot = Snapshot {
            daemons: vec![
                daemon("a:2127", DaemonState::Logged, 2),
                daemon("b:2127", DaemonState::Logged, 1),
                daemon("c:2127", DaemonState::Disconnected, 0),
            ],
            jobs: vec![JobView {
                id: JobId::new("1"),
                title: "t".into(),
                status: JobStatus::Running,
                total: 2,
                tasks: 2,
                parent_id: None,
            }],
            clients: 3,
        };
        let output = render(&snapshot);

        assert!(output.contains("maestro_daemons{state=\"logged\"} 2"));
        assert!(output.contains("maestro_daemons{state=\"disconnected\"} 1"));
        assert!(output.contains("maestro_tasks_uncompleted 3"));
        assert!(output.contains("maestro_jobs{status=\"running\"} 1"));
        assert!(output.contains("maestro_jobs{status=\"failed\"} 0"));
        assert!(output.contains("maestro_clients_connected 3"));
    }
}
