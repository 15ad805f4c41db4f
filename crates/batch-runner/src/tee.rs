use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

pub(crate) type SharedLog = Arc<Mutex<File>>;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Echo {
    Stdout,
    Stderr,
}

pub(crate) fn open_log(path: &Path) -> std::io::Result<SharedLog> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Arc::new(Mutex::new(file)))
}

/// Copies `reader` line by line into the log, echoes to the console unless
/// `quiet` matches, and forwards each line to `lines` while it has a receiver.
pub(crate) fn spawn_tee<R>(
    reader: R,
    log: SharedLog,
    echo: Echo,
    lines: Option<Sender<String>>,
    quiet: fn(&str) -> bool,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut lines = lines;
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            if let Ok(mut file) = log.lock() {
                let _ = file.write_all(&buf);
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(&['\n', '\r'][..]);
            if !quiet(line) {
                match echo {
                    Echo::Stdout => echo_line(std::io::stdout().lock(), line),
                    Echo::Stderr => echo_line(std::io::stderr().lock(), line),
                }
            }
            let closed = match &lines {
                Some(tx) => tx.send(line.to_string()).is_err(),
                None => false,
            };
            if closed {
                lines = None;
            }
        }
        if let Ok(mut file) = log.lock() {
            let _ = file.flush();
        }
    })
}

/// A closed console (`batch run | head`) must not stop the log copy.
fn echo_line<W: Write>(mut out: W, line: &str) {
    let _ = writeln!(out, "{}", line);
}

pub(crate) fn never_quiet(_: &str) -> bool {
    false
}
