#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Response, StatusCode};

pub const HEALTHZ_PATH: &str = "/healthz";
pub const READYZ_PATH: &str = "/readyz";

#[derive(Debug, Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	/// Answer a health check request, or `None` if `path` is not a health route.
	pub fn respond(&self, method: &Method, path: &str) -> Option<Response<Full<Bytes>>> {
		if path != HEALTHZ_PATH && path != READYZ_PATH {
			return None;
		}

		if method != Method::GET {
			return Some(text_response(StatusCode::METHOD_NOT_ALLOWED, ""));
		}

		let resp = match path {
			HEALTHZ_PATH => text_response(StatusCode::OK, "ok"),
			_ if self.is_ready() => text_response(StatusCode::OK, "ready"),
			_ => text_response(StatusCode::SERVICE_UNAVAILABLE, "not-ready"),
		};
		Some(resp)
	}
}

/// Small plain-text response.
pub(crate) fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
	*resp.status_mut() = status;
	resp
}
