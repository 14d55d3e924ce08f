//! Per-hop request settings and redirect retention rules.

use crate::config::{RequestMethod, SessionConfig};
use crate::target::Target;

/// Request shape for one hop of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopRequest {
    /// Method to send.
    pub method: RequestMethod,
    /// POST body.
    pub body: Option<String>,
    /// `Referer:` value.
    pub referer: Option<String>,
    /// Byte range (`first-last`).
    pub range: Option<String>,
    /// Resume offset.
    pub resume_from: Option<u64>,
    /// Upload the read-callback stream.
    pub upload: bool,
}

impl HopRequest {
    /// Request for the first hop.
    #[must_use]
    pub fn initial(config: &SessionConfig) -> Self {
        let method = config.effective_method();
        let body = match method {
            RequestMethod::Post => Some(config.post_fields.clone().unwrap_or_default()),
            _ => None,
        };
        Self {
            method,
            body,
            referer: config.referer.clone(),
            range: config.range.clone(),
            resume_from: config.resume_from,
            upload: config.upload,
        }
    }

    /// Request for the hop that follows a redirect with `status` from `from`.
    ///
    /// 303 always switches to GET; 301 and 302 switch a POST to GET. Other
    /// statuses keep the method and body. An upload is never replayed once
    /// the method changed.
    #[must_use]
    pub fn follow(&self, status: u32, from: &Target, config: &SessionConfig) -> Self {
        let switch_to_get = match status {
            303 => !matches!(self.method, RequestMethod::Head),
            301 | 302 => matches!(self.method, RequestMethod::Post),
            _ => false,
        };
        let (method, body, upload) = if switch_to_get {
            (RequestMethod::Get, None, false)
        } else {
            (self.method.clone(), self.body.clone(), self.upload)
        };
        let referer = if config.auto_referer {
            Some(from.display_url())
        } else {
            self.referer.clone()
        };
        Self {
            method,
            body,
            referer,
            range: self.range.clone(),
            resume_from: self.resume_from,
            upload,
        }
    }

    /// True when the request asks for part of the resource.
    #[must_use]
    pub fn wants_range(&self) -> bool {
        self.range.is_some() || self.resume_from.is_some_and(|offset| offset > 0)
    }
}
