//! Archive control commands.
//!
//! The management layer forwards commands by name with string parameters;
//! [`ControlCommand::parse`] turns them into a closed set that the capture
//! coordinator dispatches with a `match`.

use serde::Serialize;
use url::form_urlencoded;

use crate::assembler::Snapshot;
use crate::error::{CaptureError, Result};
use crate::model::Har;

/// A command against the open archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Return the open archive, or a clean one.
    GetArchive { clean: bool },
    /// Start a new archive with a first page.
    BeginArchive {
        page_ref: Option<String>,
        page_title: Option<String>,
    },
    /// End the open archive.
    EndArchive,
    /// Roll over to a new page.
    NewPage {
        page_ref: Option<String>,
        page_title: Option<String>,
    },
    /// End the current page.
    EndPage,
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" | "" => Ok(false),
        other => Err(CaptureError::InvalidParameter {
            name: name.to_string(),
            value: other.to_string(),
        }),
    }
}

impl ControlCommand {
    /// Parses a command name and its parameters.
    ///
    /// Recognized names are `get_har`, `new_har`, `end_har`, `new_page` and
    /// `end_page`; recognized parameters are `cleanHar`, `pageRef` and
    /// `pageTitle`. Unrecognized parameters are ignored.
    pub fn parse<'a, I>(name: &str, params: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut clean = false;
        let mut page_ref = None;
        let mut page_title = None;
        for (key, value) in params {
            match key {
                "cleanHar" => clean = parse_flag(key, value)?,
                "pageRef" => page_ref = Some(value.to_string()),
                "pageTitle" => page_title = Some(value.to_string()),
                _ => {}
            }
        }

        match name {
            "get_har" => Ok(ControlCommand::GetArchive { clean }),
            "new_har" => Ok(ControlCommand::BeginArchive { page_ref, page_title }),
            "end_har" => Ok(ControlCommand::EndArchive),
            "new_page" => Ok(ControlCommand::NewPage { page_ref, page_title }),
            "end_page" => Ok(ControlCommand::EndPage),
            other => Err(CaptureError::UnknownCommand(other.to_string())),
        }
    }

    /// Parses a command whose parameters are given as a URL query string.
    pub fn from_query(name: &str, query: &str) -> Result<Self> {
        let pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes()).into_owned().collect();
        Self::parse(name, pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// Command name as accepted by [`ControlCommand::parse`].
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::GetArchive { .. } => "get_har",
            ControlCommand::BeginArchive { .. } => "new_har",
            ControlCommand::EndArchive => "end_har",
            ControlCommand::NewPage { .. } => "new_page",
            ControlCommand::EndPage => "end_page",
        }
    }
}

/// Result of a control command: where the archive was persisted and the
/// archive itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlResponse {
    /// Path of the persisted archive.
    pub path: Option<String>,
    /// The archive document.
    pub json: Option<Har>,
}

impl ControlResponse {
    /// Serializes the response body.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<Snapshot> for ControlResponse {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            path: snapshot.handle.map(|h| h.path().display().to_string()),
            json: snapshot.har,
        }
    }
}
