// Copyright (c) The testwright Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Inference of backend files from captured API calls.
//!
//! Frontend coverage instrumentation cannot see the server. What it does see
//! is every API request a test made, and the backend follows a naming
//! convention: a route file and a controller file per resource. From each
//! request under the `/api/` prefix we synthesize the candidate files for
//! its resource. This is a heuristic -- candidates may not exist on disk.

use super::ApiRequest;
use std::collections::BTreeSet;
use url::Url;

const API_PREFIX: &str = "/api/";

/// Derives candidate backend file paths from captured requests.
///
/// Each distinct resource yields four candidates: the route file and the
/// controller file, each in both source extensions. Duplicate resources
/// across requests collapse; output is sorted.
pub fn infer_backend_files<'a>(requests: impl IntoIterator<Item = &'a ApiRequest>) -> Vec<String> {
    let mut candidates = BTreeSet::new();
    for request in requests {
        let Some(resource) = api_resource(&request.url) else {
            continue;
        };
        candidates.insert(format!("backend/routes/{resource}.ts"));
        candidates.insert(format!("backend/routes/{resource}.js"));
        candidates.insert(format!("backend/controllers/{resource}Controller.ts"));
        candidates.insert(format!("backend/controllers/{resource}Controller.js"));
    }
    candidates.into_iter().collect()
}

/// The first path segment after the API prefix, from an absolute URL or a
/// bare path.
fn api_resource(url: &str) -> Option<String> {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_owned(),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .expect("split yields at least one item")
            .to_owned(),
    };
    let rest = &path[path.find(API_PREFIX)? + API_PREFIX.len()..];
    let resource = rest.split('/').next().filter(|segment| !segment.is_empty())?;
    resource
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        .then(|| resource.to_owned())
}
