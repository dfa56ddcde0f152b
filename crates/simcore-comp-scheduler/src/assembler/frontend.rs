// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in catalog of frontend services.
//!
//! Frontend nodes (file pickers, parameters, iterators) are evaluated in the
//! browser: the frontend writes their outputs into the workbench, so they are
//! recorded as tasks but never submitted.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde_json::{Map, Value, json};

use super::collaborators::ServiceMetadata;

const FRONTEND_VERSION: &str = "1.0.0";

fn port(label: &str, description: &str, port_type: &str) -> Value {
    json!({
        "label": label,
        "description": description,
        "type": port_type,
    })
}

fn service(
    key: &str,
    name: &str,
    inputs: &[(&str, Value)],
    outputs: &[(&str, Value)],
) -> ServiceMetadata {
    let to_map = |ports: &[(&str, Value)]| -> Map<String, Value> {
        ports
            .iter()
            .map(|(name, schema)| (name.to_string(), schema.clone()))
            .collect()
    };
    ServiceMetadata {
        key: key.to_string(),
        version: FRONTEND_VERSION.to_string(),
        name: name.to_string(),
        inputs: to_map(inputs),
        outputs: to_map(outputs),
    }
}

static FRONTEND_SERVICES: Lazy<HashMap<String, ServiceMetadata>> = Lazy::new(|| {
    let mut services = vec![
        service(
            "simcore/services/frontend/file-picker",
            "File Picker",
            &[],
            &[("outFile", port("File", "Chosen File", "data:*/*"))],
        ),
        service("simcore/services/frontend/nodes-group", "Group", &[], &[]),
        service(
            "simcore/services/frontend/iterator-consumer/probe/number",
            "Probe Sensor - Number",
            &[("in_1", port("number", "Captures number", "number"))],
            &[],
        ),
    ];
    for (kind, port_type) in [
        ("number", "number"),
        ("integer", "integer"),
        ("boolean", "boolean"),
        ("string", "string"),
    ] {
        services.push(service(
            &format!("simcore/services/frontend/parameter/{}", kind),
            &format!("Parameter {}", kind),
            &[],
            &[("out_1", port(kind, "Parameter value", port_type))],
        ));
    }
    services.into_iter().map(|s| (s.key.clone(), s)).collect()
});

/// Metadata of a frontend service, `None` when the key is not built in.
pub fn frontend_service(key: &str) -> Option<&'static ServiceMetadata> {
    FRONTEND_SERVICES.get(key)
}
