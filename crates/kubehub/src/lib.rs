//! kblocks kubehub: discovery and the one-shot list used to prime a session

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use kblocks_core::{Envelope, Event, ObjUri, ObjectEvent, ObjectReason};
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::histogram;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Resource-type metadata for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Discover served resources (incl. CRDs) using kube Discovery.
pub async fn discover() -> Result<Vec<DiscoveredResource>> {
    let client = Client::try_default().await.context("creating kube client")?;
    let discovery = Discovery::new(client).run().await.context("running discovery")?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                plural: ar.plural.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

/// Build the SYNC event for one listed object. `None` when the body has no name.
pub fn sync_event(ar: &ApiResource, system: &str, mut raw: serde_json::Value, read_at: DateTime<Utc>) -> Option<Event> {
    strip_managed_fields(&mut raw);
    let meta = raw.get("metadata")?;
    let name = meta.get("name").and_then(|v| v.as_str()).filter(|s| !s.is_empty())?.to_string();
    let namespace = meta.get("namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
    let uri = ObjUri {
        group: ar.group.clone(),
        version: ar.version.clone(),
        plural: ar.plural.clone(),
        system: system.to_string(),
        namespace,
        name,
    };
    Some(Event::Object(ObjectEvent {
        envelope: Envelope {
            obj_uri: uri.to_string(),
            obj_type: uri.obj_type(),
            timestamp: read_at,
            request_id: String::new(),
        },
        object: raw,
        reason: ObjectReason::Sync,
    }))
}

/// List every object of `gvk_key` once and turn each into a SYNC event.
pub async fn list_sync_events(gvk_key: &str, namespace: Option<&str>, system: &str) -> Result<Vec<Event>> {
    let started = Instant::now();
    let client = Client::try_default().await.context("creating kube client")?;
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    let api: Api<DynamicObject> = match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
        _ => Api::all_with(client, &ar),
    };
    let list = api.list(&ListParams::default()).await.with_context(|| format!("listing {}", gvk_key))?;
    let read_at = Utc::now();
    let mut out = Vec::with_capacity(list.items.len());
    for obj in list.items {
        let raw = serde_json::to_value(&obj).context("serializing DynamicObject")?;
        match sync_event(&ar, system, raw, read_at) {
            Some(ev) => out.push(ev),
            None => debug!(gvk = %gvk_key, "kubehub: skipping object without name"),
        }
    }
    histogram!("kubehub_list_ms", started.elapsed().as_secs_f64() * 1000.0);
    info!(gvk = %gvk_key, ns = ?namespace, count = out.len(), took_ms = %started.elapsed().as_millis(), "kubehub: listed");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queues() -> ApiResource {
        ApiResource {
            group: "acme.com".into(),
            version: "v1".into(),
            api_version: "acme.com/v1".into(),
            kind: "Queue".into(),
            plural: "queues".into(),
        }
    }

    #[test]
    fn sync_event_builds_uri_and_strips_managed_fields() {
        let raw = json!({
            "apiVersion": "acme.com/v1",
            "kind": "Queue",
            "metadata": { "name": "orders", "namespace": "team-a", "managedFields": [ {} ] },
            "spec": { "timeout": 30 }
        });
        let ev = sync_event(&queues(), "dev", raw, Utc::now()).unwrap();
        let Event::Object(obj) = ev else { panic!("expected object event") };
        assert_eq!(obj.reason, ObjectReason::Sync);
        assert_eq!(obj.envelope.obj_uri, "kblocks://acme.com/v1/queues/dev/team-a/orders");
        assert_eq!(obj.envelope.obj_type, "acme.com/v1/queues");
        assert!(obj.object["metadata"].get("managedFields").is_none());
        assert_eq!(obj.object["spec"]["timeout"], 30);
    }

    #[test]
    fn cluster_scoped_and_nameless_objects() {
        let ev = sync_event(&queues(), "dev", json!({ "metadata": { "name": "global" } }), Utc::now()).unwrap();
        assert_eq!(ev.obj_uri(), "kblocks://acme.com/v1/queues/dev/-/global");
        assert!(sync_event(&queues(), "dev", json!({ "metadata": {} }), Utc::now()).is_none());
        assert!(sync_event(&queues(), "dev", json!({ "spec": {} }), Utc::now()).is_none());
    }

    #[test]
    fn gvk_keys() {
        let core = parse_gvk_key("v1/ConfigMap").unwrap();
        assert!(core.group.is_empty());
        let crd = parse_gvk_key("acme.com/v1/Queue").unwrap();
        assert_eq!(crd.group, "acme.com");
        assert!(parse_gvk_key("Queue").is_err());
    }
}
