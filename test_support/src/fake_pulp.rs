//! ABOUTME: Stateful in-memory Pulp simulation for integration tests
//! ABOUTME: Objects created through the API appear in subsequent listings

use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Shared state behind a fake Pulp server.
///
/// Every mutating call returns `{"task": href}` with the task already in
/// `completed`, so pollers observe a terminal state on the first tick.
#[derive(Default)]
pub struct FakePulpState {
    repositories: Vec<Value>,
    remotes: Vec<Value>,
    publications: Vec<Value>,
    distributions: Vec<Value>,
    tasks: Map<String, Value>,
    /// POST/PATCH mutations observed, for idempotence assertions
    pub mutations: u64,
}

/// Handle to a mounted fake Pulp server
#[derive(Clone)]
pub struct FakePulp {
    state: Arc<Mutex<FakePulpState>>,
    counter: Arc<AtomicU64>,
}

impl FakePulp {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakePulpState::default())),
            counter: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Mount the simulation as the only responder on a mock server
    pub async fn mount(&self, server: &MockServer) {
        Mock::given(any())
            .respond_with(self.clone())
            .mount(server)
            .await;
    }

    pub fn mutation_count(&self) -> u64 {
        self.state.lock().unwrap().mutations
    }

    pub fn repository_count(&self) -> usize {
        self.state.lock().unwrap().repositories.len()
    }

    pub fn remote_count(&self) -> usize {
        self.state.lock().unwrap().remotes.len()
    }

    pub fn distribution_count(&self) -> usize {
        self.state.lock().unwrap().distributions.len()
    }

    pub fn distributions(&self) -> Vec<Value> {
        self.state.lock().unwrap().distributions.clone()
    }

    pub fn repositories(&self) -> Vec<Value> {
        self.state.lock().unwrap().repositories.clone()
    }

    /// Seed a repository directly into the state, bypassing task bookkeeping
    pub fn seed_repository(&self, plugin: &str, name: &str) -> String {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let href = format!("/pulp/api/v3/repositories/{}/{}/", plugin, id);
        let body = json!({
            "pulp_href": href,
            "name": name,
            "description": null,
            "remote": null,
            "latest_version_href": format!("{}versions/0/", href),
            "signing_service": null,
        });
        self.state.lock().unwrap().repositories.push(body);
        href
    }

    fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    fn finish_task(&self, state: &mut FakePulpState, created: Vec<String>) -> ResponseTemplate {
        let task_href = format!("/pulp/api/v3/tasks/{}/", self.next_id());
        state.tasks.insert(
            task_href.clone(),
            json!({
                "pulp_href": task_href,
                "state": "completed",
                "created_resources": created,
            }),
        );
        ResponseTemplate::new(202).set_body_json(json!({ "task": task_href }))
    }

    fn list(collection: &[Value], request: &Request) -> ResponseTemplate {
        let prefix = request.url.path().to_string();
        let filters: Vec<(String, String)> = request
            .url
            .query_pairs()
            .filter(|(key, _)| key != "limit" && key != "offset" && key != "ordering")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let results: Vec<Value> = collection
            .iter()
            .filter(|obj| {
                let href = obj["pulp_href"].as_str().unwrap_or_default();
                if !href.starts_with(&prefix) {
                    return false;
                }
                filters.iter().all(|(key, value)| {
                    obj.get(key)
                        .and_then(Value::as_str)
                        .map(|actual| actual == value)
                        .unwrap_or(false)
                })
            })
            .cloned()
            .collect();

        ResponseTemplate::new(200).set_body_json(json!({
            "count": results.len(),
            "next": null,
            "previous": null,
            "results": results,
        }))
    }

    fn merge(target: &mut Value, patch: &Value) {
        if let (Some(target_map), Some(patch_map)) = (target.as_object_mut(), patch.as_object()) {
            for (key, value) in patch_map {
                target_map.insert(key.clone(), value.clone());
            }
        }
    }
}

impl Default for FakePulp {
    fn default() -> Self {
        Self::new()
    }
}

impl Respond for FakePulp {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let path = request.url.path().to_string();
        let method = request.method.to_string();
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(json!({}));
        let mut state = self.state.lock().unwrap();

        match method.as_str() {
            "GET" if path.starts_with("/pulp/api/v3/tasks/") => {
                match state.tasks.get(&path) {
                    Some(task) => ResponseTemplate::new(200).set_body_json(task.clone()),
                    None => ResponseTemplate::new(404),
                }
            }
            "GET" if path.starts_with("/pulp/api/v3/repositories/") => {
                Self::list(&state.repositories, request)
            }
            "GET" if path.starts_with("/pulp/api/v3/remotes/") => {
                Self::list(&state.remotes, request)
            }
            "GET" if path.starts_with("/pulp/api/v3/publications/") => {
                Self::list(&state.publications, request)
            }
            "GET" if path.starts_with("/pulp/api/v3/distributions/") => {
                Self::list(&state.distributions, request)
            }
            "GET" if path.starts_with("/pulp/api/v3/content/") => {
                ResponseTemplate::new(200).set_body_json(json!({
                    "count": 0, "next": null, "previous": null, "results": [],
                }))
            }
            "POST" if path.ends_with("/sync/") => {
                state.mutations += 1;
                let repo_href = path.trim_end_matches("sync/").to_string();
                let version = format!("{}versions/1/", repo_href);
                if let Some(repo) = state
                    .repositories
                    .iter_mut()
                    .find(|r| r["pulp_href"] == json!(repo_href.clone()))
                {
                    repo["latest_version_href"] = json!(version.clone());
                }
                self.finish_task(&mut state, vec![version])
            }
            "POST" if path.ends_with("/modify/") => {
                state.mutations += 1;
                self.finish_task(&mut state, vec![])
            }
            "POST" if path.starts_with("/pulp/api/v3/repositories/") => {
                state.mutations += 1;
                let href = format!("{}{}/", path, self.next_id());
                let mut object = json!({
                    "pulp_href": href,
                    "name": body["name"],
                    "description": body.get("description").cloned().unwrap_or(Value::Null),
                    "remote": body.get("remote").cloned().unwrap_or(Value::Null),
                    "latest_version_href": format!("{}versions/0/", href),
                    "signing_service": Value::Null,
                });
                Self::merge(&mut object, &body);
                object["pulp_href"] = json!(href.clone());
                state.repositories.push(object);
                self.finish_task(&mut state, vec![href])
            }
            "POST" if path.starts_with("/pulp/api/v3/remotes/") => {
                state.mutations += 1;
                let href = format!("{}{}/", path, self.next_id());
                let mut object = json!({
                    "pulp_href": href,
                    "proxy_url": Value::Null,
                    "tls_validation": Value::Null,
                });
                Self::merge(&mut object, &body);
                object["pulp_href"] = json!(href.clone());
                state.remotes.push(object);
                self.finish_task(&mut state, vec![href])
            }
            "POST" if path.starts_with("/pulp/api/v3/publications/") => {
                state.mutations += 1;
                let href = format!("{}{}/", path, self.next_id());
                let repo_href = body["repository"].as_str().unwrap_or_default().to_string();
                let version = state
                    .repositories
                    .iter()
                    .find(|r| r["pulp_href"] == json!(repo_href.clone()))
                    .and_then(|r| r["latest_version_href"].as_str())
                    .unwrap_or_default()
                    .to_string();
                let object = json!({
                    "pulp_href": href,
                    "repository_version": version,
                });
                state.publications.push(object);
                self.finish_task(&mut state, vec![href])
            }
            "POST" if path.starts_with("/pulp/api/v3/distributions/") => {
                state.mutations += 1;
                let href = format!("{}{}/", path, self.next_id());
                let mut object = json!({
                    "pulp_href": href,
                    "publication": Value::Null,
                    "repository": Value::Null,
                });
                Self::merge(&mut object, &body);
                object["pulp_href"] = json!(href.clone());
                state.distributions.push(object);
                self.finish_task(&mut state, vec![href])
            }
            "PATCH" if path.starts_with("/pulp/api/v3/repositories/") => {
                state.mutations += 1;
                let target = state
                    .repositories
                    .iter_mut()
                    .find(|r| r["pulp_href"] == json!(path.clone()));
                match target {
                    Some(object) => {
                        Self::merge(object, &body);
                        self.finish_task(&mut state, vec![path])
                    }
                    None => ResponseTemplate::new(404),
                }
            }
            "PATCH" if path.starts_with("/pulp/api/v3/remotes/") => {
                state.mutations += 1;
                let target = state
                    .remotes
                    .iter_mut()
                    .find(|r| r["pulp_href"] == json!(path.clone()));
                match target {
                    Some(object) => {
                        Self::merge(object, &body);
                        self.finish_task(&mut state, vec![path])
                    }
                    None => ResponseTemplate::new(404),
                }
            }
            "PATCH" if path.starts_with("/pulp/api/v3/distributions/") => {
                state.mutations += 1;
                let target = state
                    .distributions
                    .iter_mut()
                    .find(|d| d["pulp_href"] == json!(path.clone()));
                match target {
                    Some(object) => {
                        Self::merge(object, &body);
                        self.finish_task(&mut state, vec![path])
                    }
                    None => ResponseTemplate::new(404),
                }
            }
            "PATCH" if path.starts_with("/pulp/api/v3/tasks/") => ResponseTemplate::new(409),
            _ => ResponseTemplate::new(404),
        }
    }
}
