use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use graphweave::gateway::{Gateway, GatewayConfig};
use graphweave::schema::JsonMap;
use graphweave::{BackendConfig, Endpoint, EndpointProvider, GraphQLRequest, LinkConfig, ResolveError};

type Responder = Box<dyn Fn(&str, &JsonMap) -> Value + Send + Sync>;

struct MockBackend {
    calls: Mutex<Vec<(String, JsonMap)>>,
    respond: Responder,
}

impl MockBackend {
    fn new(respond: impl Fn(&str, &JsonMap) -> Value + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(MockBackend {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn variables_of_call(&self, index: usize) -> JsonMap {
        self.calls.lock().unwrap()[index].1.clone()
    }
}

#[async_trait]
impl Endpoint for MockBackend {
    async fn execute(&self, query: &str, variables: &JsonMap) -> Result<Value, ResolveError> {
        self.calls
            .lock()
            .unwrap()
            .push((query.to_string(), variables.clone()));
        Ok((self.respond)(query, variables))
    }
}

struct MockProvider {
    backends: HashMap<String, Arc<MockBackend>>,
}

impl EndpointProvider for MockProvider {
    fn endpoint(&self, backend: &BackendConfig) -> Arc<dyn Endpoint> {
        Arc::clone(&self.backends[&backend.name]) as Arc<dyn Endpoint>
    }
}

const POSTS_SDL: &str = "
    type Query { posts: [Post] }
    type Post { id: ID! title: String author: ID }
";

const USERS_SDL: &str = "
    type Query {
        user(id: ID!): User
        users(filter: UserFilter): [User]
    }
    input UserFilter { ids: [ID!] }
    type User { id: ID! name: String email: String }
";

fn backend(name: &str, sdl: &str, links: Vec<(&str, LinkConfig)>) -> BackendConfig {
    BackendConfig {
        name: name.to_string(),
        url: format!("http://{}.test/graphql", name),
        schema: sdl.to_string(),
        links: links
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    }
}

fn author_link(batch_mode: bool) -> LinkConfig {
    LinkConfig {
        target_backend: "users".to_string(),
        target_field: if batch_mode { "users" } else { "user" }.to_string(),
        argument: if batch_mode { "filter.ids" } else { "id" }.to_string(),
        batch_mode,
        key_field: batch_mode.then(|| "id".to_string()),
    }
}

fn compose(
    batch_mode: bool,
    posts: Arc<MockBackend>,
    users: Arc<MockBackend>,
) -> Gateway {
    let config = GatewayConfig {
        backends: vec![
            backend("posts", POSTS_SDL, vec![("Post.author", author_link(batch_mode))]),
            backend("users", USERS_SDL, Vec::new()),
        ],
    };
    let mut backends = HashMap::new();
    backends.insert("posts".to_string(), posts);
    backends.insert("users".to_string(), users);
    Gateway::compose(config, &MockProvider { backends }).unwrap()
}

fn request(query: &str) -> GraphQLRequest {
    GraphQLRequest {
        query: query.to_string(),
        variables: None,
        operation_name: None,
    }
}

fn posts_fixture(authors: &[Value]) -> Arc<MockBackend> {
    let posts: Vec<Value> = authors
        .iter()
        .enumerate()
        .map(|(i, author)| {
            json!({ "id": format!("p{}", i), "title": format!("post {}", i), "author": author })
        })
        .collect();
    let data = json!({ "data": { "posts": posts } });
    MockBackend::new(move |_, _| data.clone())
}

#[tokio::test(start_paused = true)]
async fn batched_link_issues_one_call_and_remaps_by_key() {
    let posts = posts_fixture(&[json!("1"), json!("2"), json!("1"), json!("2"), json!("1")]);
    // Results arrive permuted and carry the injected `_id` key alias; the
    // gateway must not rely on backend ordering.
    let users = MockBackend::new(|_, _| {
        json!({ "data": { "users": [
            { "_id": "2", "name": "bob" },
            { "_id": "1", "name": "alice" }
        ] } })
    });
    let gateway = compose(true, posts.clone(), users.clone());

    let response = gateway
        .process_request(request("{ posts { posts { title author { name } } } }"))
        .await;

    assert_eq!(users.call_count(), 1);
    assert_eq!(
        users.variables_of_call(0)["keys"],
        json!(["1", "2", "1", "2", "1"])
    );
    let names: Vec<&Value> = response["data"]["posts"]["posts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| &p["author"]["name"])
        .collect();
    assert_eq!(
        names,
        vec![
            &json!("alice"),
            &json!("bob"),
            &json!("alice"),
            &json!("bob"),
            &json!("alice")
        ]
    );
    assert!(response.get("errors").is_none());
}

#[tokio::test(start_paused = true)]
async fn missing_keys_in_a_batched_response_become_null() {
    let posts = posts_fixture(&[json!("1"), json!("9")]);
    let users = MockBackend::new(|_, _| {
        json!({ "data": { "users": [{ "_id": "1", "name": "alice" }] } })
    });
    let gateway = compose(true, posts, users);

    let response = gateway
        .process_request(request("{ posts { posts { author { name } } } }"))
        .await;

    assert_eq!(
        response["data"]["posts"]["posts"],
        json!([{ "author": { "name": "alice" } }, { "author": null }])
    );
}

#[tokio::test(start_paused = true)]
async fn null_keys_short_circuit_without_a_backend_call() {
    let posts = posts_fixture(&[Value::Null]);
    let users = MockBackend::new(|_, _| json!({ "data": { "users": [] } }));
    let gateway = compose(true, posts, users.clone());

    let response = gateway
        .process_request(request("{ posts { posts { title author { name } } } }"))
        .await;

    assert_eq!(users.call_count(), 0);
    assert_eq!(
        response["data"]["posts"]["posts"][0]["author"],
        Value::Null
    );
}

#[tokio::test(start_paused = true)]
async fn unbatched_link_issues_one_call_per_key() {
    let posts = posts_fixture(&[json!("1"), json!("2"), json!("3")]);
    let users = MockBackend::new(|_, variables| {
        let id = variables["key"].as_str().unwrap_or_default().to_string();
        let name = match id.as_str() {
            "1" => "alice",
            "2" => "bob",
            _ => "carol",
        };
        json!({ "data": { "user": { "id": id, "name": name } } })
    });
    let gateway = compose(false, posts, users.clone());

    let response = gateway
        .process_request(request("{ posts { posts { author { name } } } }"))
        .await;

    assert_eq!(users.call_count(), 3);
    let names: Vec<&Value> = response["data"]["posts"]["posts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| &p["author"]["name"])
        .collect();
    assert_eq!(names, vec![&json!("alice"), &json!("bob"), &json!("carol")]);
}

#[tokio::test(start_paused = true)]
async fn link_failures_null_the_field_and_keep_siblings() {
    let posts = posts_fixture(&[json!("1")]);
    let users = MockBackend::new(|_, _| {
        json!({ "data": null, "errors": [{ "message": "user service unavailable" }] })
    });
    let gateway = compose(false, posts, users);

    let response = gateway
        .process_request(request("{ posts { posts { title author { name } } } }"))
        .await;

    assert_eq!(
        response["data"]["posts"]["posts"][0]["title"],
        json!("post 0")
    );
    assert_eq!(response["data"]["posts"]["posts"][0]["author"], Value::Null);
    let message = response["errors"][0]["message"].as_str().unwrap();
    assert!(message.contains("user service unavailable"), "got: {}", message);
}

#[tokio::test(start_paused = true)]
async fn partial_batch_errors_surface_in_the_response() {
    let posts = posts_fixture(&[json!("1"), json!("2")]);
    // Some keys resolve, one does not; the backend reports the casualty in
    // its errors array next to the partial data.
    let users = MockBackend::new(|_, _| {
        json!({
            "data": { "users": [{ "_id": "1", "name": "alice" }] },
            "errors": [{ "message": "user 2 is gone" }]
        })
    });
    let gateway = compose(true, posts, users);

    let response = gateway
        .process_request(request("{ posts { posts { author { name } } } }"))
        .await;

    assert_eq!(
        response["data"]["posts"]["posts"],
        json!([{ "author": { "name": "alice" } }, { "author": null }])
    );
    assert_eq!(response["errors"][0]["message"], json!("user 2 is gone"));
    assert_eq!(
        response["errors"][0]["path"],
        json!(["posts", "posts", 0, "author"])
    );
}

#[tokio::test(start_paused = true)]
async fn aliased_link_siblings_share_one_dispatch_selection() {
    // The forwarded posts document keeps the aliases, so the key arrives
    // once under each response key.
    let posts = MockBackend::new(|_, _| {
        json!({ "data": { "posts": [{ "id": "p0", "a1": "1", "a2": "1" }] } })
    });
    let users = MockBackend::new(|_, _| {
        json!({ "data": { "users": [{ "_id": "1", "name": "alice" }] } })
    });
    let gateway = compose(true, posts, users.clone());

    // Two aliases of the same link field on one parent. The dispatch
    // document is shaped by whichever alias reaches the loader first, so
    // the second alias's extra sub-field never makes it to the backend.
    let response = gateway
        .process_request(request(
            "{ posts { posts { a1: author { name } a2: author { email } } } }",
        ))
        .await;

    assert_eq!(users.call_count(), 1);
    let forwarded = users.calls.lock().unwrap()[0].0.clone();
    assert!(forwarded.contains("name"), "got: {}", forwarded);
    assert!(!forwarded.contains("email"), "got: {}", forwarded);
    assert_eq!(
        response["data"]["posts"]["posts"][0]["a1"],
        json!({ "name": "alice" })
    );
    assert_eq!(
        response["data"]["posts"]["posts"][0]["a2"],
        json!({ "email": null })
    );
}

const MEDIA_SDL: &str = "
    type Query { feed: [Entry] }
    interface Entry { id: ID! }
    type Article implements Entry { id: ID! headline: String }
    type Clip implements Entry { id: ID! duration: Int }
";

#[tokio::test]
async fn abstract_results_resolve_by_backend_typename() {
    let media = MockBackend::new(|_, _| {
        json!({ "data": { "feed": [
            { "__typename": "Article", "id": "1", "headline": "hello" },
            { "id": "2" }
        ] } })
    });
    let config = GatewayConfig {
        backends: vec![backend("media", MEDIA_SDL, Vec::new())],
    };
    let mut backends = HashMap::new();
    backends.insert("media".to_string(), media);
    let gateway = Gateway::compose(config, &MockProvider { backends }).unwrap();

    let response = gateway
        .process_request(request(
            "{ media { feed { id ... on Media_Article { headline } } } }",
        ))
        .await;

    assert_eq!(
        response["data"]["media"]["feed"],
        json!([{ "id": "1", "headline": "hello" }, null])
    );
    assert_eq!(response["errors"][0]["path"], json!(["media", "feed", 1]));
}

#[tokio::test]
async fn forwarded_documents_strip_link_subselections() {
    let posts = posts_fixture(&[json!("1")]);
    let users = MockBackend::new(|_, _| {
        json!({ "data": { "user": { "id": "1", "name": "alice" } } })
    });
    let gateway = compose(false, posts.clone(), users);

    gateway
        .process_request(request("{ posts { posts { title author { name } } } }"))
        .await;

    let calls = posts.calls.lock().unwrap();
    let squashed: String = calls[0].0.chars().filter(|c| !c.is_whitespace()).collect();
    // The author sub-selection belongs to the users backend; the posts
    // backend only ever sees the bare key field.
    assert!(!squashed.contains("author{"), "got: {}", calls[0].0);
    assert!(squashed.contains("author"), "got: {}", calls[0].0);
}
