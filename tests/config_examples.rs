use std::{fs, path::PathBuf};

use tapedeck::{
    config::Config,
    fingerprint::fingerprint,
    forward::Upstream,
    hooks::Hooks,
    interaction::{Body, Headers, Interaction, RequestRecord},
};

fn demo_configs() -> Vec<PathBuf> {
    let demos_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos");
    let mut paths: Vec<PathBuf> = fs::read_dir(&demos_dir)
        .expect("demos directory should exist")
        .map(|entry| entry.expect("directory entry should be readable").path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("toml"))
        .collect();
    paths.sort();
    paths
}

#[test]
fn bundled_demo_configs_parse_and_compile_hooks() {
    let paths = demo_configs();
    assert!(paths.len() >= 2, "expected the bundled demo configs");

    let mut has_scrub = false;
    for path in paths {
        let config = Config::from_path(&path)
            .unwrap_or_else(|err| panic!("demo config {} should parse: {err:#}", path.display()));
        Upstream::parse(&config.upstream.url).unwrap_or_else(|err| {
            panic!("demo config {} has a bad upstream: {err}", path.display())
        });
        let hooks = Hooks::from_config(config.normalize.as_ref(), config.scrub.as_ref())
            .unwrap_or_else(|err| {
                panic!("demo config {} has bad hook rules: {err}", path.display())
            });
        has_scrub |= hooks.has_scrub();
    }

    assert!(has_scrub, "expected at least one demo with scrub rules");
}

#[test]
fn mtls_demo_resolves_tls_material_next_to_the_config() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos/tapedeck.mtls.toml");
    let config = Config::from_path(&path).expect("mtls demo should parse");
    let tls = config.upstream.tls.as_ref().expect("mtls demo should configure tls");

    let cert = config.resolve_path(tls.client_cert.as_deref().unwrap());

    assert_eq!(cert, path.parent().unwrap().join("certs/client.pem"));
    assert_eq!(config.fixture_dir(), path.parent().unwrap().join("fixtures/mtls"));
}

fn scrubbed_key(hooks: &Hooks, authorization: &str) -> (String, String) {
    let mut interaction = Interaction::new(RequestRecord {
        method: "GET".to_owned(),
        url: "/items".to_owned(),
        headers: [("authorization", authorization)].into_iter().collect::<Headers>(),
        body: Body::default(),
    });
    hooks.normalize(&mut interaction).unwrap();
    hooks.scrub(&mut interaction).unwrap();
    let stored = interaction
        .request
        .headers
        .get_str("authorization")
        .unwrap_or_default()
        .to_owned();
    (fingerprint(&interaction.request).to_string(), stored)
}

#[test]
fn demo_scrub_rules_keep_distinct_credentials_apart() {
    let credential_pairs = [
        ("Basic aGVsbG86d29ybGQ=", "Basic Z29vZGJ5ZTptb29u"),
        ("Bearer alice-token", "Bearer bob-token"),
    ];

    for path in demo_configs() {
        let config = Config::from_path(&path).unwrap();
        let hooks = Hooks::from_config(config.normalize.as_ref(), config.scrub.as_ref()).unwrap();

        for (first, second) in credential_pairs {
            let (first_key, first_stored) = scrubbed_key(&hooks, first);
            let (second_key, second_stored) = scrubbed_key(&hooks, second);

            assert_ne!(
                first_key,
                second_key,
                "{} maps `{first}` and `{second}` onto one fixture",
                path.display()
            );
            assert_ne!(first_stored, second_stored, "{}", path.display());
        }
    }
}

#[test]
fn mtls_demo_scrubs_bearer_tokens_to_a_short_prefix() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos/tapedeck.mtls.toml");
    let config = Config::from_path(&path).unwrap();
    let hooks = Hooks::from_config(config.normalize.as_ref(), config.scrub.as_ref()).unwrap();

    let (_, stored) = scrubbed_key(&hooks, "Bearer alice-token");

    assert_eq!(stored, "Bearer alic");
}
