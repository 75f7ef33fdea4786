// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resolution scenarios against sites written to disk

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};

use kea_roost::agesecrets::{AgeEngine, AgeKey, RageEngine};
use kea_roost::inventory::{
    get_inherited_secret, Collection, EncryptionRequest, HostStore, ReferenceRegistry,
    ReferenceResolver, SecretStore, CONTROLLER_ENTITY,
};
use kea_roost::localhost::Localhost;
use kea_roost::{roles, ApplyOptions, Result, RoostError, Site};

struct Fixture {
    dir: TempDir,
    node1: AgeKey,
}

impl Fixture {
    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn load(&self) -> Site {
        Site::load(self.root()).unwrap()
    }

    fn node1_key(&self) -> std::path::PathBuf {
        self.root().join("keys/node1.age")
    }

    fn node2_key(&self) -> std::path::PathBuf {
        self.root().join("keys/node2.age")
    }
}

/// Three nodes; `web` holds node1 and node2, `db` holds node2
fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let engine = RageEngine::new();

    let controller = engine.generate_keypair().unwrap();
    let node1 = engine.generate_keypair().unwrap();
    let node2 = engine.generate_keypair().unwrap();
    controller.write_to(root.join("controller.age")).unwrap();
    node1.write_to(root.join("keys/node1.age")).unwrap();
    node2.write_to(root.join("keys/node2.age")).unwrap();

    fs::create_dir_all(root.join("nodes")).unwrap();
    fs::create_dir_all(root.join("groups")).unwrap();

    fs::write(
        root.join("site.toml"),
        format!(
            r#"
name = "scenarios"

[secrets]
controller_age_pub = "{}"
controller_age_path = "controller.age"

[groups]
web = "node1 node2"
db = ["node2"]

[node_function_map]
node1 = "webserver"
node2 = "webserver"
node3 = "bare"

[function_role_map]
webserver = "settz account motd"
bare = "settz"
"#,
            controller.public
        ),
    )
    .unwrap();

    fs::write(
        root.join("groups/universal.toml"),
        r#"
[roles.settz]
timezone = "UTC"

[roles.motd]
message = "universal"
"#,
    )
    .unwrap();
    fs::write(root.join("groups/web.toml"), "[roles.motd]\nmessage = \"web\"\n").unwrap();
    fs::write(root.join("groups/db.toml"), "[roles.motd]\nmessage = \"db\"\n").unwrap();

    fs::write(
        root.join("nodes/node1.toml"),
        format!(
            r#"
address = "10.0.0.1"
age_pubkey = "{}"
age_key_path = "{}"

[roles.settz]
timezone = "US/Pacific"

[roles.account]
username = "ops"
password = {{ _ref = "secret", name = "ops_password" }}
"#,
            node1.public,
            root.join("keys/node1.age").display()
        ),
    )
    .unwrap();
    fs::write(
        root.join("nodes/node2.toml"),
        format!(
            r#"
address = "10.0.0.2"
age_pubkey = "{}"
testing_do_not_apply = true

[roles.account]
username = "deploy"

[roles.motd]
message = {{ _ref = "calculation", role = "account", key = "homedir" }}
"#,
            node2.public
        ),
    )
    .unwrap();
    fs::write(
        root.join("nodes/node3.toml"),
        r#"
address = "10.0.0.3"
user = "admin"

[roles.motd]
message = { _ref = "address", suffix = ":22" }
"#,
    )
    .unwrap();

    Fixture { dir, node1 }
}

fn store(site: &Site, request: EncryptionRequest) {
    site.secrets()
        .encrypt_secret(site.hosts(), &EncryptionRequest {
            store: true,
            ..request
        })
        .unwrap();
}

fn calculation(site: &Site, node: &str, role: &str, key: &str) -> Value {
    site.hosts()
        .node_role(site.secrets(), node, role)
        .unwrap()
        .calculations()[key]
        .clone()
}

#[test]
fn test_node_overrides_universal() {
    let fixture = fixture();
    let site = fixture.load();

    assert_eq!(calculation(&site, "node1", "settz", "timezone"), json!("US/Pacific"));
    assert_eq!(calculation(&site, "node3", "settz", "timezone"), json!("UTC"));
}

#[test]
fn test_group_overrides_universal() {
    let fixture = fixture();
    let site = fixture.load();

    let motd = site.hosts().node_role(site.secrets(), "node1", "motd").unwrap();
    assert!(format!("{:?}", motd).contains("\"web\""));
}

#[test]
fn test_conflicting_groups_need_a_node_override() {
    let fixture = fixture();

    // node2 sits in web and db; its own motd message settles the conflict
    let site = fixture.load();
    assert_eq!(
        calculation(&site, "node2", "motd", "path"),
        json!("/etc/motd")
    );

    let node2 = fixture.root().join("nodes/node2.toml");
    let contents = fs::read_to_string(&node2).unwrap();
    let without_motd = contents.split("[roles.motd]").next().unwrap().to_string();
    fs::write(&node2, without_motd).unwrap();

    let site = fixture.load();
    match site.hosts().node_role(site.secrets(), "node2", "motd") {
        Err(RoostError::GroupArgumentConflict { node, role, key, .. }) => {
            assert_eq!(node, "node2");
            assert_eq!(role, "motd");
            assert_eq!(key, "message");
        }
        other => panic!("Expected a group conflict, got {:?}", other),
    }
}

#[test]
fn test_node_secret_wins_over_group_secret() {
    let fixture = fixture();
    let site = fixture.load();

    store(&site, EncryptionRequest {
        name: "ops_password".to_string(),
        value: "from-web".to_string(),
        groups: vec!["web".to_string()],
        ..Default::default()
    });
    store(&site, EncryptionRequest {
        name: "ops_password".to_string(),
        value: "from-node1".to_string(),
        nodes: vec!["node1".to_string()],
        ..Default::default()
    });

    let hosts = site.hosts();
    let secrets = site.secrets();
    let node1 = get_inherited_secret(hosts, secrets, "node1", "ops_password").unwrap();
    assert_eq!(node1.decrypt().unwrap(), "from-node1");
    let node2 = get_inherited_secret(hosts, secrets, "node2", "ops_password").unwrap();
    assert_eq!(node2.decrypt().unwrap(), "from-web");

    assert!(matches!(
        get_inherited_secret(hosts, secrets, "node3", "ops_password"),
        Err(RoostError::SecretNotFound { .. })
    ));
}

#[test]
fn test_controller_can_decrypt_every_stored_secret() {
    let fixture = fixture();
    let site = fixture.load();

    store(&site, EncryptionRequest {
        name: "token".to_string(),
        value: "node2-only".to_string(),
        nodes: vec!["node2".to_string()],
        ..Default::default()
    });

    let secret = site.secrets().get_secret(Collection::Node, "node2", "token").unwrap();
    assert_eq!(secret.decrypt().unwrap(), "node2-only");

    let mut site = fixture.load();
    let mut args = BTreeMap::new();
    args.insert("age_key".to_string(), fixture.node1_key().display().to_string());
    site.apply_secret_store_arguments(&args).unwrap();
    let secret = site.secrets().get_secret(Collection::Node, "node2", "token").unwrap();
    assert!(matches!(
        secret.decrypt(),
        Err(RoostError::DecryptionKeyMissing { .. })
    ));
}

#[test]
fn test_controller_only_secrets() {
    let fixture = fixture();
    let site = fixture.load();

    store(&site, EncryptionRequest {
        name: "api_token".to_string(),
        value: "controller-eyes-only".to_string(),
        controller_key: true,
        ..Default::default()
    });
    assert!(fixture.root().join("controller.secrets.json").exists());

    let secrets = site.secrets();
    assert_eq!(
        secrets.list_secrets(Collection::Special, CONTROLLER_ENTITY).unwrap(),
        vec!["api_token"]
    );
    let secret = secrets
        .get_secret(Collection::Special, CONTROLLER_ENTITY, "api_token")
        .unwrap();
    assert_eq!(secret.decrypt().unwrap(), "controller-eyes-only");
    for node in ["node1", "node2", "node3"] {
        assert!(secrets.list_secrets(Collection::Node, node).unwrap().is_empty());
    }
    assert!(secrets.list_secrets(Collection::Group, "web").unwrap().is_empty());

    let mut site = fixture.load();
    let mut args = BTreeMap::new();
    args.insert("age_key".to_string(), fixture.node2_key().display().to_string());
    site.apply_secret_store_arguments(&args).unwrap();
    let secret = site
        .secrets()
        .get_secret(Collection::Special, CONTROLLER_ENTITY, "api_token")
        .unwrap();
    assert!(secret.decrypt().is_err());
}

#[test]
fn test_resolved_roles_are_shared() {
    let fixture = fixture();
    let site = fixture.load();
    let hosts = site.hosts();

    let first = hosts.node_role(site.secrets(), "node2", "motd").unwrap();
    let second = hosts.node_role(site.secrets(), "node2", "motd").unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    // motd pulled account's homedir, so account is already resolved
    let account = hosts.node_role(site.secrets(), "node2", "account").unwrap();
    assert_eq!(account.calculations()["homedir"], json!("/home/deploy"));
    assert!(format!("{:?}", first).contains("/home/deploy"));

    let list = hosts.node_role_list(site.secrets(), "node2").unwrap();
    assert!(Arc::ptr_eq(&list[1], &account));
    assert!(Arc::ptr_eq(&list[2], &first));
}

#[test]
fn test_calculation_cycle_is_reported() {
    let fixture = fixture();
    fs::write(
        fixture.root().join("nodes/node3.toml"),
        r#"
address = "10.0.0.3"

[roles.account]
username = "ops"
home = { _ref = "calculation", role = "motd", key = "path" }

[roles.motd]
path = { _ref = "calculation", role = "account", key = "homedir" }
"#,
    )
    .unwrap();

    let site = fixture.load();
    match site.hosts().node_role(site.secrets(), "node3", "motd") {
        Err(RoostError::RoleResolutionCycle { node, chain }) => {
            assert_eq!(node, "node3");
            assert_eq!(chain, vec!["motd", "account", "motd"]);
        }
        other => panic!("Expected a cycle, got {:?}", other),
    }

    // A failed resolution leaves nothing half-resolved behind
    assert!(site.hosts().node_role(site.secrets(), "node3", "settz").is_ok());
}

/// Resolves `{ _ref = "address", suffix = "..." }` to the node's address
struct AddressResolver;

impl ReferenceResolver for AddressResolver {
    fn dereference(
        &self,
        payload: &Value,
        node: &str,
        hosts: &HostStore,
        _secrets: &dyn SecretStore,
    ) -> Result<Value> {
        let suffix = payload.get("suffix").and_then(Value::as_str).unwrap_or("");
        let node = hosts.node(node)?;
        Ok(Value::String(format!("{}@{}{}", node.user, node.address, suffix)))
    }
}

#[test]
fn test_custom_reference_resolver() {
    let fixture = fixture();

    let site = fixture.load();
    assert!(matches!(
        site.hosts().node_role(site.secrets(), "node3", "motd"),
        Err(RoostError::UnknownReference { .. })
    ));

    let mut references = ReferenceRegistry::builtin();
    references.register("address", AddressResolver);
    let site = Site::load_with(
        fixture.root(),
        roles::builtin(),
        references,
        Arc::new(RageEngine::new()),
    )
    .unwrap();
    let motd = site.hosts().node_role(site.secrets(), "node3", "motd").unwrap();
    assert!(format!("{:?}", motd).contains("admin@10.0.0.3:22"));
}

#[tokio::test]
async fn test_apply_uses_the_node_key() {
    let fixture = fixture();
    let site = fixture.load();
    store(&site, EncryptionRequest {
        name: "ops_password".to_string(),
        value: "from-node1".to_string(),
        nodes: vec!["node1".to_string()],
        ..Default::default()
    });

    let mut site = fixture.load();
    let root = tempdir().unwrap();
    let localhost = Localhost::new().with_root(root.path()).with_dry_run(true);
    let applied = site
        .apply("node1", &ApplyOptions::default(), &localhost)
        .await
        .unwrap();
    assert_eq!(applied, vec!["settz", "account", "motd"]);
    assert_eq!(site.secrets().decryption_key(), Some(fixture.node1_key().as_path()));
    assert!(!root.path().join("etc/motd").exists());

    let node1 = site.hosts().node("node1").unwrap();
    assert_eq!(node1.age_pubkey.as_deref(), Some(fixture.node1.public.as_str()));
}

#[tokio::test]
async fn test_apply_refuses_test_nodes() {
    let fixture = fixture();
    let mut site = fixture.load();
    let root = tempdir().unwrap();
    let localhost = Localhost::new().with_root(root.path());

    assert!(matches!(
        site.apply("node2", &ApplyOptions::default(), &localhost).await,
        Err(RoostError::ApplyRefused { .. })
    ));

    let options = ApplyOptions {
        roles: vec!["motd".to_string()],
        force: true,
    };
    let applied = site.apply("node2", &options, &localhost).await.unwrap();
    assert_eq!(applied, vec!["motd"]);

    let motd = fs::read_to_string(root.path().join("etc/motd")).unwrap();
    assert!(motd.contains("Welcome to node2 (10.0.0.2)"));
    assert!(motd.contains("/home/deploy"));
}

#[tokio::test]
async fn test_apply_rejects_roles_outside_the_function() {
    let fixture = fixture();
    let mut site = fixture.load();
    let localhost = Localhost::new().with_dry_run(true);

    let options = ApplyOptions {
        roles: vec!["account".to_string()],
        force: false,
    };
    assert!(matches!(
        site.apply("node3", &options, &localhost).await,
        Err(RoostError::UnknownRole { .. })
    ));
}
