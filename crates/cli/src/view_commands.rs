//! `view` and `sanitize`: render a message assembled from raw files.

use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use {
    anyhow::{Context, Result, bail},
    clap::Args,
    mimeview_common::{Header, Message, MessagePart, MimeType},
    mimeview_config::MimeviewConfig,
    mimeview_pipeline::{DisplaySurface, Geometry, LaunchOutcome, Session, ViewerLauncher},
    tracing::{debug, info, warn},
};

#[derive(Args, Debug)]
pub struct ViewArgs {
    /// Body file, or `-` for stdin.
    pub file: PathBuf,
    /// Type of the body part.
    #[arg(long, default_value = "text/plain")]
    pub mime: MimeType,
    /// Header to forward to the pager, as `Key: Value`. Repeatable.
    #[arg(long = "header", value_name = "HEADER")]
    pub headers: Vec<Header>,
    /// Additional part, as `FILE:type/subtype`. Repeatable.
    #[arg(long = "part", value_name = "FILE:TYPE/SUBTYPE")]
    pub parts: Vec<PartSpec>,
}

/// An extra part given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartSpec {
    pub path: PathBuf,
    pub mime: MimeType,
}

impl FromStr for PartSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (path, mime) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected FILE:type/subtype, got `{s}`"))?;
        if path.is_empty() {
            return Err(format!("missing file in `{s}`"));
        }
        let mime = mime.parse::<MimeType>().map_err(|e| e.to_string())?;
        Ok(Self {
            path: PathBuf::from(path),
            mime,
        })
    }
}

impl ViewArgs {
    /// Build the message: the body part first, then extra parts in order.
    pub fn into_message(self) -> Result<Message> {
        let mut parts = Vec::with_capacity(1 + self.parts.len());
        parts.push(part_from(&self.file, self.mime)?);
        for spec in self.parts {
            parts.push(part_from(&spec.path, spec.mime)?);
        }
        Ok(Message::new(self.headers, parts))
    }
}

fn part_from(path: &Path, mime: MimeType) -> Result<MessagePart> {
    let content = read_input(path)?;
    debug!(path = %path.display(), %mime, size = content.len(), "loaded part");
    Ok(MessagePart::new(mime.type_, mime.subtype, content))
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("failed to read stdin")?;
        return Ok(buf);
    }
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

/// The controlling terminal, drawn into directly by the pager.
#[derive(Debug, Default)]
pub struct TerminalSurface;

impl DisplaySurface for TerminalSurface {
    fn geometry(&self) -> Geometry {
        match crossterm::terminal::size() {
            Ok((width, height)) if width > 0 && height > 0 => Geometry { width, height },
            Ok(_) => Geometry::default(),
            Err(e) => {
                debug!(error = %e, "terminal size unavailable, using default");
                Geometry::default()
            },
        }
    }

    fn request_rerender(&self) {
        // The pager owns the screen; there is nothing of ours to redraw.
        debug!("rerender requested");
    }
}

pub async fn view(config: MimeviewConfig, args: ViewArgs) -> Result<()> {
    let message = args.into_message()?;
    let session = Arc::new(Session::new("cli", Arc::new(TerminalSurface)));
    let launcher = ViewerLauncher::with_tokio(config);

    let outcome = launcher.launch(&session, &message).await;
    if let Ok(LaunchOutcome::ViewerLaunched(id)) = outcome {
        info!(%id, "viewer running");
        session.wait_viewer_closed().await;
    }
    session.teardown().await;

    match outcome? {
        LaunchOutcome::NoRenderablePart => bail!("message has no renderable part"),
        LaunchOutcome::Cancelled => warn!("render request cancelled"),
        LaunchOutcome::ViewerLaunched(_) => {},
    }
    Ok(())
}

pub fn sanitize(path: &Path) -> Result<()> {
    let content = read_input(path)?;
    let clean = mimeview_pipeline::sanitize::sanitized(&content);
    debug!(before = content.len(), after = clean.len(), "sanitized input");
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&clean)?;
    stdout.flush()?;
    Ok(())
}
