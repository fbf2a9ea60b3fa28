//! End-to-end builds against a fake base rootfs, with in-process certificate
//! and package backends.

use async_trait::async_trait;
use botstrap::deps::{InstallRequest, PackageInstaller};
use botstrap::env::LaunchSpec;
use botstrap::image::OciLayout;
use botstrap::launch::resolve_environment;
use botstrap::runtime::constants::labels;
use botstrap::trust::{Certificate, CertificateFetcher, parse_certificate_payload, parse_pem_bundle};
use botstrap::{
    BotstrapError, BotstrapResult, BuildPlan, BuildState, BuildStore, Database, ImageBuilder,
    Recipe, StageKind,
};
use flate2::read::GzDecoder;
use pretty_assertions::assert_eq;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const CA1_URL: &str = "https://pki.example.test/ops-root.pem";
const CA2_URL: &str = "https://pki.example.test/proxy-root.pem";
const LOCK: &str = "aiohttp==3.9.5\npython-telegram-bot==21.4\n";

struct TestCa {
    key: KeyPair,
    cert: rcgen::Certificate,
}

impl TestCa {
    fn new(common_name: &str) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self { key, cert }
    }

    fn pem(&self) -> String {
        self.cert.pem()
    }

    /// A server certificate for `host` issued by this CA.
    fn issue(&self, host: &str) -> Vec<u8> {
        let mut params = CertificateParams::new(vec![host.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, host);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let key = KeyPair::generate().unwrap();
        let leaf = params.signed_by(&key, &self.cert, &self.key).unwrap();
        leaf.der().to_vec()
    }
}

/// Serves canned PEM payloads; any other URL is unreachable.
struct StaticFetcher {
    payloads: HashMap<String, String>,
    roots_seen: Mutex<Vec<usize>>,
}

impl StaticFetcher {
    fn new(payloads: &[(&str, String)]) -> Self {
        Self {
            payloads: payloads
                .iter()
                .map(|(url, pem)| (url.to_string(), pem.clone()))
                .collect(),
            roots_seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CertificateFetcher for StaticFetcher {
    async fn fetch(&self, url: &str, roots: &[Certificate]) -> BotstrapResult<Vec<Certificate>> {
        self.roots_seen.lock().unwrap().push(roots.len());
        let payload = self
            .payloads
            .get(url)
            .ok_or_else(|| BotstrapError::Fetch(format!("{}: connection refused", url)))?;
        parse_certificate_payload(payload.as_bytes()).map_err(BotstrapError::Fetch)
    }
}

/// Writes one module directory per package instead of running pip.
#[derive(Default)]
struct FakeInstaller {
    calls: AtomicUsize,
    no_deps: Mutex<Vec<bool>>,
    /// Requirement reported unmet by `check`, as `(package, dependency)`.
    unmet: Option<(String, String)>,
}

impl FakeInstaller {
    fn missing(package: &str, dependency: &str) -> Self {
        Self {
            unmet: Some((package.to_string(), dependency.to_string())),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PackageInstaller for FakeInstaller {
    async fn install(&self, request: &InstallRequest<'_>) -> BotstrapResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.no_deps.lock().unwrap().push(request.no_deps);
        for package in request.packages.packages.values() {
            let module = request.target.join(package.name.replace('-', "_"));
            std::fs::create_dir_all(&module)?;
            std::fs::write(module.join("__init__.py"), format!("# {}\n", package.spec))?;
        }
        Ok(())
    }

    async fn check(&self, request: &InstallRequest<'_>) -> BotstrapResult<()> {
        match &self.unmet {
            Some((package, dependency)) if request.packages.packages.contains_key(package) => {
                Err(BotstrapError::Resolution(format!(
                    "{} requires {}, which is not installed",
                    package, dependency
                )))
            }
            _ => Ok(()),
        }
    }
}

struct Fixture {
    dir: TempDir,
    base_ca: TestCa,
    ops_ca: TestCa,
    proxy_ca: TestCa,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let base_ca = TestCa::new("Distro Root");
        let ops_ca = TestCa::new("Ops Root");
        let proxy_ca = TestCa::new("Egress Proxy Root");

        let base = dir.path().join("rootfs");
        write(
            &base.join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\nnobody:x:65534:65534:nobody:/nonexistent:/usr/sbin/nologin\n",
        );
        write(&base.join("etc/group"), "root:x:0:\nnogroup:x:65534:\n");
        write(&base.join("etc/ssl/certs/ca-certificates.crt"), &base_ca.pem());
        write(&base.join("usr/share/zoneinfo/Europe/Berlin"), "TZif2");
        std::fs::create_dir_all(base.join("root")).unwrap();

        write(
            &dir.path().join("app/main.py"),
            "import os\nprint(os.environ['TELEGRAM_BOT_TOKEN'][:3])\n",
        );
        write(&dir.path().join("app/handlers/__init__.py"), "");
        write(&dir.path().join("requirements.lock"), LOCK);
        write(&dir.path().join("launcher"), "#!/bin/true\n");

        Self {
            dir,
            base_ca,
            ops_ca,
            proxy_ca,
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn recipe_text(&self) -> String {
        format!(
            r#"
[image]
base = "rootfs"
reference = "helpline-bot:1.0"

[[trust.anchors]]
name = "ops-root"
url = "{CA1_URL}"

[[trust.anchors]]
name = "proxy-root"
url = "{CA2_URL}"

[dependencies]
manifest = "requirements.lock"

[payload]
source = "app"
launcher = "launcher"

[environment]
timezone = "Europe/Berlin"
auth_token = "TELEGRAM_BOT_TOKEN"
locked = ["PYTHONPATH"]

[environment.vars]
LOG_LEVEL = "info"

[entrypoint]
argv = ["python3", "main.py"]
"#
        )
    }

    fn recipe(&self) -> Recipe {
        self.parse(&self.recipe_text())
    }

    fn parse(&self, text: &str) -> Recipe {
        Recipe::parse(text, self.path()).unwrap()
    }

    fn fetcher(&self) -> Arc<StaticFetcher> {
        Arc::new(StaticFetcher::new(&[
            (CA1_URL, self.ops_ca.pem()),
            (CA2_URL, self.proxy_ca.pem()),
        ]))
    }

    fn output(&self, name: &str) -> PathBuf {
        self.path().join("out").join(name)
    }

    fn builder(
        &self,
        recipe: Recipe,
        output: &Path,
        fetcher: Arc<StaticFetcher>,
        installer: Arc<FakeInstaller>,
    ) -> ImageBuilder {
        std::fs::create_dir_all(output.parent().unwrap()).unwrap();
        ImageBuilder::new(recipe, output)
            .unwrap()
            .with_fetcher(fetcher)
            .with_installer(installer)
    }
}

fn write(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn history() -> BuildStore {
    BuildStore::new(Database::open_in_memory().unwrap())
}

/// Entries of layer `index` as (path, uid, contents).
fn layer_entries(output: &Path, index: usize) -> Vec<(PathBuf, u64, Vec<u8>)> {
    let layout = OciLayout::open(output);
    let manifest = layout.read_manifest().unwrap();
    let digest = manifest.layers()[index].digest().to_string();
    let file = std::fs::File::open(layout.blob_path(&digest).unwrap()).unwrap();

    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().into_owned();
            let uid = entry.header().uid().unwrap();
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).unwrap();
            (path, uid, contents)
        })
        .collect()
}

fn layer_file(output: &Path, index: usize, path: &str) -> Vec<u8> {
    layer_entries(output, index)
        .into_iter()
        .find(|(p, _, _)| p == Path::new(path))
        .map(|(_, _, contents)| contents)
        .unwrap_or_else(|| panic!("{} not in layer {}", path, index))
}

fn leftovers(parent: &Path) -> Vec<String> {
    match std::fs::read_dir(parent) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn test_build_publishes_least_privilege_image() {
    let fixture = Fixture::new();
    let output = fixture.output("bot");
    let installer = Arc::new(FakeInstaller::default());
    let store = history();

    let outcome = fixture
        .builder(fixture.recipe(), &output, fixture.fetcher(), installer.clone())
        .with_launcher_binary(fixture.path().join("launcher"))
        .with_history(store.clone())
        .build()
        .await
        .unwrap();

    assert_eq!(outcome.output, output);
    assert!(output.join("index.json").is_file());
    assert!(output.join("oci-layout").is_file());
    assert_eq!(outcome.image.layers, 7);
    assert_eq!(installer.calls(), 1);
    assert_eq!(*installer.no_deps.lock().unwrap(), vec![true]);

    let states: Vec<BuildState> = outcome.ledger.entries.iter().map(|e| e.to).collect();
    assert_eq!(states, BuildState::ALL[1..].to_vec());
    assert!(outcome.ledger.is_complete());

    let layout = OciLayout::open(&output);
    let config = layout.read_config().unwrap();
    let runtime = config.config().as_ref().unwrap();
    assert_eq!(runtime.user().as_deref(), Some("botuser"));
    assert_eq!(runtime.working_dir().as_deref(), Some("/app"));
    assert_eq!(
        runtime.entrypoint().clone().unwrap(),
        vec!["/usr/local/bin/botstrap", "launch", "--", "python3", "main.py"]
    );

    let env = runtime.env().clone().unwrap();
    assert!(env.contains(&"TZ=Europe/Berlin".to_string()));
    assert!(env.contains(&"LOG_LEVEL=info".to_string()));
    assert!(env.iter().all(|e| !e.starts_with("TELEGRAM_BOT_TOKEN")));

    let image_labels = runtime.labels().as_ref().unwrap();
    assert_eq!(image_labels[labels::SECRETS], "TELEGRAM_BOT_TOKEN");
    assert_eq!(image_labels[labels::IDENTITY_UID], "1000");
    assert!(image_labels[labels::DEPENDENCY_DIGEST].starts_with("sha256:"));

    let record = store.get(&outcome.build_id).unwrap().unwrap();
    assert_eq!(record.status.as_str(), "published");
    assert_eq!(record.manifest_digest.as_deref(), Some(outcome.image.manifest_digest.as_str()));
    assert_eq!(store.transition_count(&outcome.build_id).unwrap(), 6);

    // Only the published image remains next to the output.
    assert_eq!(leftovers(output.parent().unwrap()), vec!["bot".to_string()]);
}

#[tokio::test]
async fn test_stages_after_deescalation_never_run_as_root() {
    let fixture = Fixture::new();
    let output = fixture.output("bot");

    let outcome = fixture
        .builder(fixture.recipe(), &output, fixture.fetcher(), Arc::default())
        .build()
        .await
        .unwrap();

    for entry in &outcome.ledger.entries {
        match entry.to {
            BuildState::TrustInstalled
            | BuildState::DependenciesInstalled
            | BuildState::PayloadStaged => assert_eq!(entry.identity, "root", "{}", entry.stage),
            _ => assert_eq!(entry.identity, "botuser(1000)", "{}", entry.stage),
        }
    }

    // Identity layer: account records plus a home owned by the new uid.
    let identity = layer_entries(&output, 4);
    let passwd = identity
        .iter()
        .find(|(p, _, _)| p == Path::new("etc/passwd"))
        .unwrap();
    assert!(String::from_utf8_lossy(&passwd.2).contains("botuser:x:1000:1000:"));
    let home = identity
        .iter()
        .find(|(p, _, _)| p == Path::new("home/botuser"))
        .unwrap();
    assert_eq!(home.1, 1000);

    // The payload and the launch spec stay root-owned.
    assert!(layer_entries(&output, 3).iter().all(|(_, uid, _)| *uid == 0));
    assert!(layer_entries(&output, 5).iter().all(|(_, uid, _)| *uid == 0));
}

#[tokio::test]
async fn test_rebuilt_bundle_verifies_servers_under_installed_anchors() {
    use rustls::RootCertStore;
    use rustls::client::WebPkiServerVerifier;
    use rustls::client::danger::ServerCertVerifier;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

    let fixture = Fixture::new();
    let output = fixture.output("bot");
    let fetcher = fixture.fetcher();

    fixture
        .builder(fixture.recipe(), &output, fetcher.clone(), Arc::default())
        .build()
        .await
        .unwrap();

    // Anchors were fetched with only the base image's roots.
    assert_eq!(*fetcher.roots_seen.lock().unwrap(), vec![1, 1]);

    let bundle = layer_file(&output, 1, "etc/ssl/certs/ca-certificates.crt");
    let bundle = parse_pem_bundle(std::str::from_utf8(&bundle).unwrap()).unwrap();
    assert_eq!(bundle.len(), 3);

    let mut roots = RootCertStore::empty();
    for cert in &bundle {
        roots.add(CertificateDer::from(cert.der().to_vec())).unwrap();
    }
    let verifier = WebPkiServerVerifier::builder_with_provider(
        Arc::new(roots),
        Arc::new(rustls::crypto::ring::default_provider()),
    )
    .build()
    .unwrap();

    let host = ServerName::try_from("api.example.test").unwrap();
    for ca in [&fixture.ops_ca, &fixture.proxy_ca, &fixture.base_ca] {
        let leaf = CertificateDer::from(ca.issue("api.example.test"));
        verifier
            .verify_server_cert(&leaf, &[], &host, &[], UnixTime::now())
            .unwrap();
    }

    let stranger = TestCa::new("Unknown Root");
    let leaf = CertificateDer::from(stranger.issue("api.example.test"));
    assert!(
        verifier
            .verify_server_cert(&leaf, &[], &host, &[], UnixTime::now())
            .is_err()
    );
}

#[tokio::test]
async fn test_same_manifest_gives_same_dependency_digest() {
    let fixture = Fixture::new();
    let mut digests = Vec::new();

    for name in ["first", "second"] {
        let output = fixture.output(name);
        fixture
            .builder(fixture.recipe(), &output, fixture.fetcher(), Arc::default())
            .build()
            .await
            .unwrap();
        let config = OciLayout::open(&output).read_config().unwrap();
        let digest = config.config().as_ref().unwrap().labels().as_ref().unwrap()
            [labels::DEPENDENCY_DIGEST]
            .clone();
        digests.push(digest);
    }

    assert_eq!(digests[0], digests[1]);
}

#[tokio::test]
async fn test_unreachable_anchor_aborts_before_dependencies() {
    let fixture = Fixture::new();
    let output = fixture.output("bot");
    let installer = Arc::new(FakeInstaller::default());
    let store = history();
    let fetcher = Arc::new(StaticFetcher::new(&[(CA1_URL, fixture.ops_ca.pem())]));

    let err = fixture
        .builder(fixture.recipe(), &output, fetcher, installer.clone())
        .with_history(store.clone())
        .build()
        .await
        .unwrap_err();

    assert!(matches!(err, BotstrapError::Fetch(_)), "{err}");
    assert_eq!(installer.calls(), 0);
    assert!(!output.exists());
    assert!(leftovers(output.parent().unwrap()).is_empty());

    let record = store.list(1).unwrap().remove(0);
    assert_eq!(record.status.as_str(), "failed");
    assert_eq!(record.state, BuildState::Start.as_str());
    assert!(record.error.unwrap().contains("connection refused"));
}

#[tokio::test]
async fn test_unsatisfiable_manifest_publishes_nothing() {
    let fixture = Fixture::new();
    write(
        &fixture.path().join("requirements.lock"),
        "aiohttp==3.9.5\naiohttp==3.8.6\n",
    );
    let output = fixture.output("bot");
    let installer = Arc::new(FakeInstaller::default());

    let err = fixture
        .builder(fixture.recipe(), &output, fixture.fetcher(), installer.clone())
        .build()
        .await
        .unwrap_err();

    assert!(matches!(err, BotstrapError::Resolution(_)), "{err}");
    assert_eq!(installer.calls(), 0);
    assert!(!output.exists());
}

#[tokio::test]
async fn test_missing_transitive_dependency_publishes_nothing() {
    let fixture = Fixture::new();
    let output = fixture.output("bot");
    let installer = Arc::new(FakeInstaller::missing("aiohttp", "yarl"));
    let store = history();

    let err = fixture
        .builder(fixture.recipe(), &output, fixture.fetcher(), installer.clone())
        .with_history(store.clone())
        .build()
        .await
        .unwrap_err();

    assert!(matches!(err, BotstrapError::Resolution(ref m) if m.contains("yarl")), "{err}");
    assert_eq!(installer.calls(), 1);
    assert_eq!(*installer.no_deps.lock().unwrap(), vec![true]);
    let record = store.list(1).unwrap().remove(0);
    assert_eq!(record.state, BuildState::TrustInstalled.as_str());
    assert!(!output.exists());
}

#[tokio::test]
async fn test_missing_payload_fails_before_identity() {
    let fixture = Fixture::new();
    std::fs::remove_dir_all(fixture.path().join("app")).unwrap();
    let output = fixture.output("bot");
    let store = history();

    let err = fixture
        .builder(fixture.recipe(), &output, fixture.fetcher(), Arc::default())
        .with_history(store.clone())
        .build()
        .await
        .unwrap_err();

    assert!(matches!(err, BotstrapError::MissingSource(_)), "{err}");
    let record = store.list(1).unwrap().remove(0);
    assert_eq!(record.state, BuildState::DependenciesInstalled.as_str());
    assert!(!output.exists());
}

#[tokio::test]
async fn test_existing_account_is_an_identity_conflict() {
    let fixture = Fixture::new();
    write(
        &fixture.path().join("rootfs/etc/passwd"),
        "root:x:0:0:root:/root:/bin/sh\nbotuser:x:1000:1000::/home/botuser:/bin/sh\n",
    );
    let output = fixture.output("bot");

    let err = fixture
        .builder(fixture.recipe(), &output, fixture.fetcher(), Arc::default())
        .build()
        .await
        .unwrap_err();

    assert!(matches!(err, BotstrapError::IdentityConflict(_)), "{err}");
    assert!(!output.exists());
}

#[tokio::test]
async fn test_reordered_plan_is_rejected_before_work() {
    let fixture = Fixture::new();
    let output = fixture.output("bot");
    let fetcher = fixture.fetcher();

    let plan = BuildPlan::new(vec![
        botstrap::build::StageSpec::standard(StageKind::TrustStore),
        botstrap::build::StageSpec::standard(StageKind::Dependencies),
        botstrap::build::StageSpec::standard(StageKind::Identity),
        botstrap::build::StageSpec::standard(StageKind::Payload),
        botstrap::build::StageSpec::standard(StageKind::Environment),
        botstrap::build::StageSpec::standard(StageKind::Entrypoint),
    ]);

    let err = fixture
        .builder(fixture.recipe(), &output, fetcher.clone(), Arc::default())
        .with_plan(plan)
        .build()
        .await
        .unwrap_err();

    assert!(matches!(err, BotstrapError::Plan(_)), "{err}");
    assert!(fetcher.roots_seen.lock().unwrap().is_empty());
    assert!(!output.exists());
}

#[tokio::test]
async fn test_existing_output_is_not_overwritten() {
    let fixture = Fixture::new();
    let output = fixture.output("bot");
    write(&output.join("keep.txt"), "mine");

    let err = fixture
        .builder(fixture.recipe(), &output, fixture.fetcher(), Arc::default())
        .build()
        .await
        .unwrap_err();

    assert!(matches!(err, BotstrapError::Config(_)), "{err}");
    assert_eq!(std::fs::read_to_string(output.join("keep.txt")).unwrap(), "mine");
}

#[tokio::test]
async fn test_launch_spec_applies_overrides_and_secrets() {
    let fixture = Fixture::new();
    let output = fixture.output("bot");

    fixture
        .builder(fixture.recipe(), &output, fixture.fetcher(), Arc::default())
        .build()
        .await
        .unwrap();

    let spec = LaunchSpec::from_json(&layer_file(&output, 5, "etc/botstrap/launch.json")).unwrap();
    assert_eq!(spec.user, "botuser");
    assert_eq!(spec.argv, vec!["python3", "main.py"]);
    assert_eq!(spec.working_dir.as_deref(), Some("/app"));

    let secrets = TempDir::new().unwrap();
    std::fs::write(
        secrets.path().join("telegram_bot_token"),
        "123456:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\n",
    )
    .unwrap();

    let inherited: BTreeMap<OsString, OsString> = [
        ("TZ", "America/Chicago"),
        ("PYTHONPATH", "/tmp/evil"),
        ("HOSTNAME", "bot-7f9c"),
    ]
    .into_iter()
    .map(|(k, v)| (OsString::from(k), OsString::from(v)))
    .collect();

    let env = resolve_environment(&spec, &inherited, secrets.path()).unwrap();
    let get = |name: &str| env[OsStr::new(name)].to_str().unwrap().to_string();
    assert_eq!(get("TZ"), "America/Chicago");
    assert_eq!(get("LOG_LEVEL"), "info");
    assert_eq!(get("PYTHONPATH"), botstrap::recipe::DEFAULT_PACKAGE_TARGET);
    assert_eq!(get("HOSTNAME"), "bot-7f9c");
    assert_eq!(get("TELEGRAM_BOT_TOKEN"), "123456:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");

    let empty = TempDir::new().unwrap();
    let err = resolve_environment(&spec, &BTreeMap::new(), empty.path()).unwrap_err();
    assert!(matches!(err, BotstrapError::Secret(_)), "{err}");
}

#[test]
fn test_recipe_rejects_baked_token() {
    let fixture = Fixture::new();
    let text = fixture.recipe_text().replace(
        "LOG_LEVEL = \"info\"",
        "LOG_LEVEL = \"info\"\nBOT_KEY = \"123456789:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw0\"",
    );

    let err = Recipe::parse(&text, fixture.path()).unwrap_err();
    assert!(matches!(err, BotstrapError::Secret(_)), "{err}");
}
