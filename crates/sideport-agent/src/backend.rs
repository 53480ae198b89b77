use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{process::Command, sync::Mutex};
use tracing::{debug, info, warn};

use crate::protocol::{Point, MULTI_TOUCH_STAGGER_MS};

/// Injects gestures into the guest. Every call reports plain success.
#[async_trait]
pub trait GestureBackend: Send + Sync {
    fn is_ready(&self) -> bool {
        true
    }

    async fn tap(&self, at: Point, duration: Duration) -> bool;

    async fn swipe(&self, from: Point, to: Point, duration: Duration) -> bool;

    async fn multi_touch(&self, points: &[Point], duration: Duration) -> bool;
}

/// Drives Android's `input` tool. Gestures are serialized so two clients
/// cannot interleave touches.
pub struct InputCommandBackend {
    program: PathBuf,
    shell: PathBuf,
    gate: Mutex<()>,
}

impl Default for InputCommandBackend {
    fn default() -> Self {
        Self::new("input")
    }
}

impl InputCommandBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            shell: PathBuf::from("sh"),
            gate: Mutex::new(()),
        }
    }

    /// Shell used to submit multi-touch scripts.
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    async fn run(&self, args: &[String]) -> bool {
        self.run_program(&self.program, args).await
    }

    async fn run_program(&self, program: &Path, args: &[String]) -> bool {
        debug!("{} {}", program.display(), args.join(" "));
        match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
        {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                warn!(
                    "{} {} failed: {}",
                    program.display(),
                    args.first().map(String::as_str).unwrap_or(""),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Err(err) => {
                warn!("failed to run {}: {err}", program.display());
                false
            }
        }
    }
}

fn swipe_args(from: Point, to: Point, duration: Duration) -> Vec<String> {
    vec![
        "swipe".into(),
        from.x.to_string(),
        from.y.to_string(),
        to.x.to_string(),
        to.y.to_string(),
        duration.as_millis().to_string(),
    ]
}

fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

fn seconds(duration: Duration) -> String {
    format!("{}.{:03}", duration.as_secs(), duration.subsec_millis())
}

/// One shell submission holding every pointer of a multi-touch gesture. Each
/// pointer presses `MULTI_TOUCH_STAGGER_MS * index` after the first, holds for
/// `duration`, and lifts. Pointers run side by side; the script fails if any
/// of them does.
fn multi_touch_script(program: &Path, points: &[Point], duration: Duration) -> String {
    let input = shell_quote(&program.display().to_string());
    let hold = seconds(duration);
    let mut script = String::new();
    for (index, p) in points.iter().enumerate() {
        let offset = Duration::from_millis(MULTI_TOUCH_STAGGER_MS * index as u64);
        script.push('(');
        if !offset.is_zero() {
            script.push_str(&format!("sleep {} && ", seconds(offset)));
        }
        script.push_str(&format!(
            "{input} motionevent DOWN {x} {y} && sleep {hold} && {input} motionevent UP {x} {y}) & p{index}=$!; ",
            x = p.x,
            y = p.y
        ));
    }
    script.push_str("s=0; ");
    for index in 0..points.len() {
        script.push_str(&format!("wait $p{index} || s=1; "));
    }
    script.push_str("exit $s");
    script
}

fn find_command(cmd: &Path) -> Option<PathBuf> {
    if cmd.components().count() > 1 {
        return cmd.is_file().then(|| cmd.to_path_buf());
    }
    std::env::var_os("PATH")
        .into_iter()
        .flat_map(|paths| std::env::split_paths(&paths).collect::<Vec<_>>())
        .chain([PathBuf::from("/system/bin")])
        .map(|dir| dir.join(cmd))
        .find(|candidate| candidate.is_file())
}

#[async_trait]
impl GestureBackend for InputCommandBackend {
    fn is_ready(&self) -> bool {
        find_command(&self.program).is_some()
    }

    async fn tap(&self, at: Point, duration: Duration) -> bool {
        let _gate = self.gate.lock().await;
        // `input tap` has no hold time; a zero-length swipe does.
        self.run(&swipe_args(at, at, duration)).await
    }

    async fn swipe(&self, from: Point, to: Point, duration: Duration) -> bool {
        let _gate = self.gate.lock().await;
        self.run(&swipe_args(from, to, duration)).await
    }

    async fn multi_touch(&self, points: &[Point], duration: Duration) -> bool {
        if points.is_empty() {
            return false;
        }
        let _gate = self.gate.lock().await;
        let script = multi_touch_script(&self.program, points, duration);
        self.run_program(&self.shell, &["-c".to_string(), script])
            .await
    }
}

/// Logs gestures and reports success. For dry runs off-device.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogBackend;

#[async_trait]
impl GestureBackend for LogBackend {
    async fn tap(&self, at: Point, duration: Duration) -> bool {
        info!("tap ({}, {}) for {}ms", at.x, at.y, duration.as_millis());
        true
    }

    async fn swipe(&self, from: Point, to: Point, duration: Duration) -> bool {
        info!(
            "swipe ({}, {}) -> ({}, {}) over {}ms",
            from.x,
            from.y,
            to.x,
            to.y,
            duration.as_millis()
        );
        true
    }

    async fn multi_touch(&self, points: &[Point], duration: Duration) -> bool {
        info!("multi-touch {} point(s) for {}ms", points.len(), duration.as_millis());
        !points.is_empty()
    }
}

/// `log` or `input` (default). `input=<path>` picks a specific binary.
pub fn backend_from_name(name: &str) -> Option<Arc<dyn GestureBackend>> {
    let name = name.trim();
    match name {
        "log" => Some(Arc::new(LogBackend)),
        "" | "input" => Some(Arc::new(InputCommandBackend::default())),
        _ => name
            .strip_prefix("input=")
            .map(|path| Arc::new(InputCommandBackend::new(path)) as Arc<dyn GestureBackend>),
    }
}
