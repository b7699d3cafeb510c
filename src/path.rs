//! Node names, similar to filesystem paths, plus the few filesystem
//! operations the engine needs.
//!
//! A path is a sequence of components with an `absolute` flag and a
//! `virtual` flag. Virtual paths name things with no filesystem presence
//! (rules, dictionaries, aggregates) and render with a leading `//`.

use std::fmt;

use crate::error::{Error, Result};

pub const SEPARATOR: char = '/';

#[derive(Debug, Clone, Eq)]
pub struct Path {
    /// Components; absolute paths keep a leading empty component so the
    /// display form round-trips.
    comps: Vec<String>,
    absolute: bool,
    pub virtual_: bool,
}

impl Path {
    pub fn new(path: &str) -> Path {
        let mut path = path;
        let mut virtual_ = false;
        if let Some(rest) = path.strip_prefix("//") {
            path = rest;
            virtual_ = true;
        }
        let mut comps: Vec<String> = if path.is_empty() {
            Vec::new()
        } else {
            path.split(SEPARATOR).map(str::to_owned).collect()
        };
        let absolute = comps.first().map(|c| c.is_empty()).unwrap_or(false);
        // A trailing separator contributes an empty component; drop it.
        if comps.len() > 1 && comps.last().map(|c| c.is_empty()).unwrap_or(false) {
            comps.pop();
        }
        Path {
            comps,
            absolute,
            virtual_,
        }
    }

    fn from_comps(comps: Vec<String>, absolute: bool, virtual_: bool) -> Path {
        Path {
            comps,
            absolute,
            virtual_,
        }
    }

    pub fn absolute(&self) -> bool {
        self.absolute
    }

    pub fn empty(&self) -> bool {
        self.comps.is_empty()
    }

    /// The filename part of the path; errors on an empty path.
    pub fn basename(&self) -> Result<Path> {
        match self.comps.last() {
            Some(last) => Ok(Path::from_comps(vec![last.clone()], false, false)),
            None => Err(Error::Invalid(
                "cannot take the basename of an empty path".to_owned(),
            )),
        }
    }

    /// The directory part of the path; errors on an empty path.
    pub fn dirname(&self) -> Result<Path> {
        if self.comps.is_empty() {
            return Err(Error::Invalid(
                "cannot take the dirname of an empty path".to_owned(),
            ));
        }
        Ok(Path::from_comps(
            self.comps[..self.comps.len() - 1].to_vec(),
            self.absolute,
            false,
        ))
    }

    /// Concatenation; the right operand must not be absolute.
    pub fn join(&self, rhs: impl Into<Path>) -> Result<Path> {
        let rhs = rhs.into();
        if rhs.absolute {
            return Err(Error::Invalid(format!(
                "cannot concatenate an absolute path: {}",
                rhs
            )));
        }
        if self.is_dot() {
            return Ok(rhs);
        }
        if rhs.is_dot() {
            return Ok(self.clone());
        }
        let mut comps = self.comps.clone();
        comps.extend(rhs.comps);
        Ok(Path::from_comps(comps, self.absolute, self.virtual_))
    }

    fn is_dot(&self) -> bool {
        self.comps.is_empty() || self.comps == ["."]
    }

    /// Remove a leading subsequence. If `rhs` is not a prefix, rewind with
    /// enough parent components to make self relative to `rhs`.
    pub fn strip_prefix(&mut self, rhs: impl Into<Path>) {
        let rhs = rhs.into();
        let mut rhs = rhs.comps.as_slice();
        let mut comps = self.comps.as_slice();
        while let (Some(r), Some(c)) = (rhs.first(), comps.first()) {
            if r != c {
                break;
            }
            rhs = &rhs[1..];
            comps = &comps[1..];
        }
        let mut out: Vec<String> = rhs.iter().map(|_| "..".to_owned()).collect();
        out.extend(comps.iter().cloned());
        if out.is_empty() {
            out.push(".".to_owned());
        }
        self.absolute = out.first().map(|c| c.is_empty()).unwrap_or(false);
        self.comps = out;
    }

    /// Remove an exact trailing subsequence; errors otherwise.
    pub fn strip_suffix(&mut self, rhs: impl Into<Path>) -> Result<()> {
        let rhs = rhs.into();
        if rhs.comps.len() > self.comps.len()
            || self.comps[self.comps.len() - rhs.comps.len()..] != rhs.comps[..]
        {
            return Err(Error::Invalid(format!(
                "{} is not a suffix of {}",
                rhs, self
            )));
        }
        self.comps.truncate(self.comps.len() - rhs.comps.len());
        if self.comps.is_empty() {
            self.comps.push(".".to_owned());
        }
        self.absolute = self.comps.first().map(|c| c.is_empty()).unwrap_or(false);
        Ok(())
    }

    /// Text after the first dot of the basename, or "".
    pub fn extension(&self) -> String {
        match self.comps.last() {
            Some(last) => match last.split_once('.') {
                Some((_, ext)) => ext.to_owned(),
                None => String::new(),
            },
            None => String::new(),
        }
    }

    /// Replace the extension; an empty value drops it.
    pub fn set_extension(&mut self, value: &str) {
        let Some(last) = self.comps.last_mut() else {
            return;
        };
        match last.split_once('.') {
            Some((stem, _)) => {
                if value.is_empty() {
                    *last = stem.to_owned();
                } else {
                    *last = format!("{}.{}", stem, value);
                }
            }
            None => {
                if !value.is_empty() {
                    last.push('.');
                    last.push_str(value);
                }
            }
        }
    }

    /// Remove the last dot of the basename and what follows; no-op without
    /// a dot.
    pub fn extension_strip_last_component(&mut self) {
        let ext = self.extension();
        match ext.rsplit_once('.') {
            Some((head, _)) => self.set_extension(head),
            None => self.set_extension(""),
        }
    }

    pub fn exists(&self) -> bool {
        let s = self.to_string();
        let p = std::path::Path::new(&s);
        p.symlink_metadata().is_ok()
    }

    pub fn is_file(&self) -> bool {
        std::path::Path::new(&self.to_string()).is_file()
    }

    /// Create the designated file and its parent directories if missing;
    /// no-op when the file exists.
    pub fn touch(&self) -> Result<()> {
        let dir = self.dirname()?;
        if !dir.empty() {
            dir.mkpath()?;
        }
        if !self.exists() {
            std::fs::File::create(self.to_string())?;
        }
        Ok(())
    }

    /// Create the designated directory and its parents.
    pub fn mkpath(&self) -> Result<()> {
        std::fs::create_dir_all(self.to_string())?;
        Ok(())
    }

    /// Delete the file or directory tree; a missing target is an error only
    /// when `err` is set.
    pub fn remove(&self, err: bool) -> Result<()> {
        let s = self.to_string();
        let p = std::path::Path::new(&s);
        match p.symlink_metadata() {
            Ok(meta) => {
                if meta.is_dir() {
                    std::fs::remove_dir_all(p)?;
                } else {
                    std::fs::remove_file(p)?;
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if err {
                    Err(Error::Invalid(format!("path does not exist: {}", s)))
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.virtual_ {
            write!(f, "//")?;
        }
        if self.comps.is_empty() {
            write!(f, ".")
        } else if self.comps.len() == 1 && self.comps[0].is_empty() {
            write!(f, "/")
        } else {
            write!(f, "{}", self.comps.join("/"))
        }
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Path) -> bool {
        fn neutralize(comps: &[String]) -> &[String] {
            const DOT: &[String] = &[];
            if comps.len() == 1 && comps[0] == "." {
                DOT
            } else {
                comps
            }
        }
        neutralize(&self.comps) == neutralize(&other.comps) && self.virtual_ == other.virtual_
    }
}

impl std::hash::Hash for Path {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_string().hash(state);
    }
}

impl PartialOrd for Path {
    fn partial_cmp(&self, other: &Path) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Path {
    fn cmp(&self, other: &Path) -> std::cmp::Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Path {
        Path::new(s)
    }
}

impl From<String> for Path {
    fn from(s: String) -> Path {
        Path::new(&s)
    }
}

impl From<&Path> for Path {
    fn from(p: &Path) -> Path {
        p.clone()
    }
}
