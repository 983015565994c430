use hds_miner_core::difficulty::Difficulty;
use hds_miner_engine::{DeviceStage, EngineEvent};

/// One line of console output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Out(String),
    Err(String),
}

pub fn format_uptime(secs: i64) -> String {
    let secs = secs.max(0);
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (h, m, s) = (rem / 3_600, (rem % 3_600) / 60, rem % 60);
    if days > 0 {
        format!("{days}d {h:02}:{m:02}:{s:02}")
    } else {
        format!("{h:02}:{m:02}:{s:02}")
    }
}

pub fn format_difficulty(difficulty: Difficulty) -> String {
    let value = difficulty.to_float();
    if value.is_infinite() {
        "inf".to_string()
    } else if value >= 1e6 {
        format!("{value:.3e}")
    } else {
        format!("{value:.3}")
    }
}

pub fn stage_label(stage: DeviceStage) -> &'static str {
    match stage {
        DeviceStage::Idle => "Idle",
        DeviceStage::Dispatched => "Searching",
        DeviceStage::Collecting => "Checking",
        DeviceStage::Paused => "Waiting for work",
        DeviceStage::Failed => "Failed",
    }
}

pub fn format_new_job_line(
    work_id: i64,
    difficulty: Difficulty,
    height: Option<u64>,
    accepted: u64,
    rejected: u64,
) -> String {
    let height = height.map(|h| format!(" (height {h})")).unwrap_or_default();
    format!(
        "New job {work_id}{height} | Difficulty {} | Solutions (Accepted/Rejected): {accepted}/{rejected}",
        format_difficulty(difficulty)
    )
}

/// Console line for an engine event; `None` for events only the status
/// display cares about.
pub fn format_event(event: &EngineEvent) -> Option<Line> {
    let line = match event {
        EngineEvent::Started
        | EngineEvent::StopRequested
        | EngineEvent::DeviceStage { .. }
        | EngineEvent::Stopped => return None,
        EngineEvent::Connecting { server } => Line::Out(format!("Connecting to {server}...")),
        EngineEvent::Connected { endpoint } => Line::Out(format!("Connected to {endpoint}")),
        EngineEvent::LoginAccepted { nonce_prefix } if nonce_prefix.is_empty() => {
            Line::Out("Logged in".to_string())
        }
        EngineEvent::LoginAccepted { nonce_prefix } => {
            Line::Out(format!("Logged in (nonce prefix {nonce_prefix})"))
        }
        EngineEvent::ConnectionLost {
            reason,
            retry_in_ms,
        } => Line::Err(format!(
            "Connection lost: {reason}; retrying in {:.1}s",
            *retry_in_ms as f64 / 1000.0
        )),
        EngineEvent::NewJob {
            work_id,
            difficulty,
            height,
            accepted,
            rejected,
        } => Line::Out(format_new_job_line(*work_id, *difficulty, *height, *accepted, *rejected)),
        EngineEvent::JobCancelled { work_id } => Line::Out(format!("Job {work_id} cancelled")),
        EngineEvent::ForkHeightReached { height } => {
            Line::Out(format!("Fork height {height} reached, switching algorithm"))
        }
        EngineEvent::SolutionSubmitted {
            device_idx,
            work_id,
            nonce,
            variant,
        } => Line::Out(format!(
            "GPU{device_idx}: solution for job {work_id} submitted ({variant}, nonce {nonce})"
        )),
        EngineEvent::ShareAccepted {
            work_id,
            accepted,
            rejected,
        } => Line::Out(format!(
            "Solution for job {work_id} accepted | Accepted/Rejected: {accepted}/{rejected}"
        )),
        EngineEvent::ShareRejected {
            work_id,
            code,
            accepted,
            rejected,
        } => Line::Err(format!(
            "Solution for job {work_id} rejected (code {code}) | Accepted/Rejected: {accepted}/{rejected}"
        )),
        EngineEvent::DeviceFailed {
            device_idx,
            message,
        } => Line::Err(format!("GPU{device_idx} failed and was dropped: {message}")),
        EngineEvent::Warning { message } => Line::Err(format!("warning: {message}")),
        EngineEvent::Error { message } => Line::Err(format!("error: {message}")),
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_formats() {
        assert_eq!(format_uptime(0), "00:00:00");
        assert_eq!(format_uptime(3_725), "01:02:05");
        assert_eq!(format_uptime(2 * 86_400 + 61), "2d 00:01:01");
        assert_eq!(format_uptime(-5), "00:00:00");
    }

    #[test]
    fn new_job_line_shows_counts() {
        let line = format_new_job_line(42, Difficulty::from_packed(0), Some(900), 3, 1);
        assert_eq!(
            line,
            "New job 42 (height 900) | Difficulty 1.000 | Solutions (Accepted/Rejected): 3/1"
        );
        let line = format_new_job_line(7, Difficulty::from_packed(Difficulty::INF), None, 0, 0);
        assert!(line.starts_with("New job 7 | Difficulty inf |"));
    }

    #[test]
    fn events_map_to_streams() {
        assert_eq!(format_event(&EngineEvent::Stopped), None);
        assert_eq!(
            format_event(&EngineEvent::LoginAccepted {
                nonce_prefix: String::new()
            }),
            Some(Line::Out("Logged in".to_string()))
        );
        assert!(matches!(
            format_event(&EngineEvent::ShareRejected {
                work_id: "9".to_string(),
                code: 2,
                accepted: 0,
                rejected: 1,
            }),
            Some(Line::Err(_))
        ));
    }
}
