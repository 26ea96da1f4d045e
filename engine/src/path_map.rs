//! Source root to staging root mapping.
//!
//! Mapping is lexical and does not touch the filesystem, so Windows drive
//! and UNC paths map the same way on every host. Two rules, in order:
//!
//! 1. A source under a configured special root (e.g.
//!    `O:\Massive Data Imaging`) gets the marker right after that root:
//!    `O:\Massive Data Imaging\Grp\Rec1` -> `O:\Massive Data Imaging\TAPE_TRANSFER\Grp\Rec1`
//! 2. Otherwise the marker goes right after the anchor:
//!    `D:\foo\bar` -> `D:\TAPE_TRANSFER\foo\bar`,
//!    `\\srv\share\foo` -> `\\srv\share\TAPE_TRANSFER\foo`,
//!    `/mnt/data` -> `/TAPE_TRANSFER/mnt/data`

use std::path::{Path, PathBuf};

use crate::error::EngineError;

/// Directory name inserted into every mapped path.
pub const STAGING_MARKER: &str = "TAPE_TRANSFER";

/// The slow-storage volume that keeps its top-level folder above the marker.
pub const DEFAULT_SPECIAL_ROOT: &str = r"O:\Massive Data Imaging";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    Windows,
    Posix,
}

impl Style {
    fn separator(self) -> char {
        match self {
            Style::Windows => '\\',
            Style::Posix => '/',
        }
    }

    fn same_component(self, a: &str, b: &str) -> bool {
        match self {
            // NTFS and SMB shares compare names case-insensitively
            Style::Windows => a.to_lowercase() == b.to_lowercase(),
            Style::Posix => a == b,
        }
    }
}

/// A path split into its anchor and plain components.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedPath {
    style: Style,
    anchor: String,
    components: Vec<String>,
}

fn invalid(path: &str, reason: &str) -> EngineError {
    EngineError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

fn split_components(rest: &str, style: Style) -> Vec<String> {
    let is_sep = |c: char| match style {
        Style::Windows => c == '\\' || c == '/',
        Style::Posix => c == '/',
    };
    rest.split(is_sep)
        .filter(|c| !c.is_empty() && *c != ".")
        .map(str::to_string)
        .collect()
}

fn parse_unc(original: &str, rest: &str) -> Result<ParsedPath, EngineError> {
    let mut parts = split_components(rest, Style::Windows).into_iter();
    let (server, share) = match (parts.next(), parts.next()) {
        (Some(server), Some(share)) => (server, share),
        _ => return Err(invalid(original, "UNC path needs a server and a share")),
    };
    Ok(ParsedPath {
        style: Style::Windows,
        anchor: format!(r"\\{}\{}\", server, share),
        components: parts.collect(),
    })
}

fn parse(path: &str) -> Result<ParsedPath, EngineError> {
    if path.trim().is_empty() {
        return Err(invalid(path, "empty path"));
    }

    // Verbatim and device prefixes: \\?\D:\x, \\?\UNC\srv\share\x
    if let Some(rest) = path
        .strip_prefix(r"\\?\")
        .or_else(|| path.strip_prefix(r"\\.\"))
    {
        if rest.get(..4).is_some_and(|p| p.eq_ignore_ascii_case(r"UNC\")) {
            return parse_unc(path, &rest[4..]);
        }
        return parse(rest).map_err(|_| invalid(path, "unparseable verbatim path"));
    }

    let bytes = path.as_bytes();
    let is_sep = |b: u8| b == b'\\' || b == b'/';

    if bytes.len() >= 2 && is_sep(bytes[0]) && is_sep(bytes[1]) {
        return parse_unc(path, &path[2..]);
    }

    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        // `D:data` resolves against D:'s current directory, which is not
        // known lexically
        if !bytes.get(2).is_some_and(|b| is_sep(*b)) {
            return Err(invalid(path, "drive-relative path; add a separator after the drive"));
        }
        return Ok(ParsedPath {
            style: Style::Windows,
            anchor: format!(r"{}:\", &path[..1]),
            components: split_components(&path[2..], Style::Windows),
        });
    }

    match bytes[0] {
        b'\\' => Ok(ParsedPath {
            style: Style::Windows,
            anchor: r"\".to_string(),
            components: split_components(path, Style::Windows),
        }),
        b'/' => Ok(ParsedPath {
            style: Style::Posix,
            anchor: "/".to_string(),
            components: split_components(path, Style::Posix),
        }),
        _ => Err(invalid(path, "no drive, share or root anchor")),
    }
}

fn render(style: Style, anchor: &str, components: &[String]) -> PathBuf {
    let sep = style.separator().to_string();
    PathBuf::from(format!("{}{}", anchor, components.join(&sep)))
}

/// The two directories a source root maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingLayout {
    /// The marker directory itself; holds the lock marker
    pub staging_root: PathBuf,

    /// Mirror of the source root inside the staging root
    pub target_root: PathBuf,
}

impl StagingLayout {
    /// Destination for a source-relative path; the empty path is the
    /// target root itself.
    pub fn destination_for(&self, rel: &Path) -> PathBuf {
        if rel.as_os_str().is_empty() {
            self.target_root.clone()
        } else {
            self.target_root.join(rel)
        }
    }
}

/// Maps source roots to staging roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapper {
    marker: String,
    special_roots: Vec<String>,
}

impl Default for PathMapper {
    fn default() -> Self {
        PathMapper {
            marker: STAGING_MARKER.to_string(),
            special_roots: vec![DEFAULT_SPECIAL_ROOT.to_string()],
        }
    }
}

impl PathMapper {
    pub fn new(marker: impl Into<String>, special_roots: Vec<String>) -> Self {
        PathMapper {
            marker: marker.into(),
            special_roots,
        }
    }

    /// Replace the special roots.
    pub fn with_special_roots<I, S>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.special_roots = roots.into_iter().map(Into::into).collect();
        self
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn special_roots(&self) -> &[String] {
        &self.special_roots
    }

    /// Number of leading source components that stay above the marker.
    fn special_prefix_len(&self, source: &ParsedPath) -> usize {
        for root in &self.special_roots {
            // Unparseable special roots simply never match
            let Ok(root) = parse(root) else { continue };
            if root.style != source.style
                || !source.style.same_component(&root.anchor, &source.anchor)
                || root.components.len() > source.components.len()
            {
                continue;
            }
            let matches = root
                .components
                .iter()
                .zip(&source.components)
                .all(|(r, s)| source.style.same_component(r, s));
            if matches {
                return root.components.len();
            }
        }
        0
    }

    /// Map a source root to its staging layout.
    ///
    /// # Errors
    /// `InvalidPath` when the input is empty or has no anchor.
    pub fn map(&self, source: &str) -> Result<StagingLayout, EngineError> {
        let parsed = parse(source)?;
        let keep = self.special_prefix_len(&parsed);

        let mut staging: Vec<String> = parsed.components[..keep].to_vec();
        staging.push(self.marker.clone());

        let mut target = staging.clone();
        target.extend_from_slice(&parsed.components[keep..]);

        Ok(StagingLayout {
            staging_root: render(parsed.style, &parsed.anchor, &staging),
            target_root: render(parsed.style, &parsed.anchor, &target),
        })
    }

    pub fn map_path(&self, source: &Path) -> Result<StagingLayout, EngineError> {
        self.map(&source.to_string_lossy())
    }

    /// True if any component of `path` is the staging marker.
    pub fn contains_marker(&self, path: &str) -> bool {
        path.split(['\\', '/'])
            .any(|c| c.to_lowercase() == self.marker.to_lowercase())
    }
}

/// Whether a path has a drive, share or root anchor.
pub fn has_anchor(path: &str) -> bool {
    parse(path).is_ok()
}
