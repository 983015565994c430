use std::io::Write;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use hds_miner_engine::{DeviceSnapshot, DeviceStage, StatusSnapshot};

use crate::format::{format_difficulty, format_uptime, stage_label};

fn line_style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

struct DeviceLine {
    device_idx: usize,
    bar: ProgressBar,
}

/// Status display: one pool line, one line per device and a stop notice.
pub(crate) struct Ui {
    mp: MultiProgress,
    global_pb: ProgressBar,
    stop_pb: ProgressBar,
    device_style: ProgressStyle,
    devices: Vec<DeviceLine>,
}

impl Ui {
    pub(crate) fn new() -> Self {
        let mp = MultiProgress::new();
        mp.set_draw_target(ProgressDrawTarget::stdout());
        mp.set_move_cursor(true);

        let global_pb = mp.add(ProgressBar::new(0));
        global_pb.set_style(line_style("{msg}\u{1b}[0K"));
        global_pb.set_message("Pool: connecting");

        let stop_pb = mp.add(ProgressBar::new(0));
        stop_pb.set_style(line_style("{msg}\u{1b}[0K"));
        stop_pb.set_message(" ");

        Self {
            mp,
            global_pb,
            stop_pb,
            device_style: line_style("{prefix} {spinner} {msg}\u{1b}[0K"),
            devices: Vec::new(),
        }
    }

    pub(crate) fn println(&self, msg: &str) {
        let _ = self.mp.println(msg);
    }

    fn device_bar(&mut self, device_idx: usize) -> &ProgressBar {
        let pos = match self.devices.iter().position(|d| d.device_idx == device_idx) {
            Some(pos) => pos,
            None => {
                let bar = self.mp.insert_before(&self.stop_pb, ProgressBar::new(0));
                bar.set_style(self.device_style.clone());
                bar.set_prefix(format!("GPU{device_idx}"));
                self.devices.push(DeviceLine { device_idx, bar });
                self.devices.len() - 1
            }
        };
        &self.devices[pos].bar
    }

    pub(crate) fn refresh(&mut self, snap: &StatusSnapshot, now: i64) {
        self.global_pb.set_message(global_line(snap, now));
        for device in &snap.devices {
            let msg = device_line(device);
            let searching = device.stage == DeviceStage::Dispatched;
            let bar = self.device_bar(device.device_idx);
            bar.set_message(msg);
            if searching {
                bar.tick();
            }
        }
    }

    pub(crate) fn set_stop_message(&mut self, msg: &str) {
        self.stop_pb.set_message(msg.to_string());
    }

    pub(crate) fn freeze(&self) {
        self.mp.set_move_cursor(false);
        for device in &self.devices {
            device.bar.abandon();
        }
        self.global_pb.abandon();
        self.stop_pb.abandon();
        let _ = std::io::stdout().write_all(b"\n");
    }
}

fn global_line(snap: &StatusSnapshot, now: i64) -> String {
    let pool = if snap.connected { "connected" } else { "offline" };
    let job = match (snap.work_id, snap.difficulty) {
        (Some(id), Some(diff)) => format!("Job {id} | Difficulty {}", format_difficulty(diff)),
        (Some(id), None) => format!("Job {id}"),
        _ => "No job".to_string(),
    };
    format!(
        "Pool: {pool} | {job} | Accepted/Rejected: {}/{} | Uptime {}",
        snap.accepted,
        snap.rejected,
        format_uptime(now - snap.started_at)
    )
}

fn device_line(device: &DeviceSnapshot) -> String {
    format!(
        "{} | {} | rounds {} | solutions {}",
        device.name,
        stage_label(device.stage),
        device.rounds,
        device.solutions
    )
}
