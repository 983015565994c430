use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossterm::event::{Event, KeyCode, KeyEvent, KeyModifiers};
use tokio::sync::mpsc;

use crate::shutdown::{ShutdownController, ShutdownEvent};

const KEY_POLL: Duration = Duration::from_millis(200);

// Raw mode clears OPOST, which breaks `\n` for the progress lines.
#[cfg(unix)]
fn enable_onlcr() -> anyhow::Result<()> {
    use std::os::fd::AsRawFd as _;

    let fd = std::io::stdout().as_raw_fd();
    unsafe {
        let mut termios: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut termios) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        termios.c_oflag |= (libc::OPOST | libc::ONLCR) as libc::tcflag_t;
        if libc::tcsetattr(fd, libc::TCSANOW, &termios) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

fn is_stop_key(key: &KeyEvent) -> bool {
    match key.code {
        KeyCode::Char('c') => key.modifiers.contains(KeyModifiers::CONTROL),
        KeyCode::Char('q') => key.modifiers.is_empty(),
        _ => false,
    }
}

/// Raw-mode terminal for the status display. In raw mode Ctrl-C arrives as a
/// key press, so a reader thread turns `Ctrl-C` and `q` into shutdown events.
pub struct StatusTerminal {
    stop: Arc<AtomicBool>,
    reader: Option<std::thread::JoinHandle<()>>,
}

impl StatusTerminal {
    pub fn enter(
        shutdown: Arc<ShutdownController>,
        shutdown_tx: mpsc::UnboundedSender<ShutdownEvent>,
    ) -> anyhow::Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        #[cfg(unix)]
        if let Err(err) = enable_onlcr() {
            let _ = crossterm::terminal::disable_raw_mode();
            return Err(err);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_reader = stop.clone();
        let reader = std::thread::spawn(move || {
            while !stop_reader.load(Ordering::Relaxed) {
                if !crossterm::event::poll(KEY_POLL).unwrap_or(false) {
                    continue;
                }
                let Ok(Event::Key(key)) = crossterm::event::read() else {
                    continue;
                };
                if is_stop_key(&key) && shutdown_tx.send(shutdown.interrupt()).is_err() {
                    return;
                }
            }
        });

        Ok(Self {
            stop,
            reader: Some(reader),
        })
    }
}

impl Drop for StatusTerminal {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = crossterm::terminal::disable_raw_mode();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}
