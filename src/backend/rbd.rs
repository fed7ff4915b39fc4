//! RBD image management and OSD blacklisting through the Ceph CLI.

use super::{CommandRunner, ImageBackend, ImageRef};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{Api, Client};
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MIB: i64 = 1024 * 1024;
const SECRET_KEY: &str = "key";
const IMAGE_WATCHER: &str = "watcher=";
const MISSING_IMAGE: &str = "No such file or directory";
const SUPPORTED_FEATURES: &[&str] = &["layering"];

/// Provisioning options resolved from a StorageClass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOptions {
    pub monitors: Vec<String>,
    pub pool: String,
    pub data_pool: String,
    pub admin_id: String,
    pub admin_secret_name: String,
    pub admin_secret_namespace: String,
    pub user_id: String,
    pub user_secret_name: String,
    pub user_secret_namespace: String,
    pub fs_type: String,
    pub image_format: String,
    pub image_features: Vec<String>,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            monitors: Vec::new(),
            pool: "rbd".to_string(),
            data_pool: String::new(),
            admin_id: "admin".to_string(),
            admin_secret_name: String::new(),
            admin_secret_namespace: "default".to_string(),
            user_id: String::new(),
            user_secret_name: String::new(),
            user_secret_namespace: String::new(),
            fs_type: String::new(),
            image_format: "2".to_string(),
            image_features: Vec::new(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidArgument(msg.into())
}

impl ImageOptions {
    /// Parse StorageClass parameters. Keys are case-insensitive; unknown keys are rejected.
    pub fn parse(params: &BTreeMap<String, String>) -> Result<Self> {
        let mut opts = ImageOptions::default();

        for (key, value) in params {
            match key.to_lowercase().as_str() {
                "monitors" => {
                    opts.monitors = value
                        .split(',')
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(str::to_string)
                        .collect();
                    if opts.monitors.is_empty() {
                        return Err(invalid("missing Ceph monitors"));
                    }
                }
                "adminid" => {
                    if value.is_empty() {
                        return Err(invalid("missing Ceph adminid"));
                    }
                    opts.admin_id = value.clone();
                }
                "adminsecretname" => opts.admin_secret_name = value.clone(),
                "adminsecretnamespace" => opts.admin_secret_namespace = value.clone(),
                "userid" => opts.user_id = value.clone(),
                "pool" => {
                    if value.is_empty() {
                        return Err(invalid("missing Ceph pool"));
                    }
                    opts.pool = value.clone();
                }
                "datapool" => opts.data_pool = value.clone(),
                "usersecretname" => {
                    if value.is_empty() {
                        return Err(invalid("missing user secret name"));
                    }
                    opts.user_secret_name = value.clone();
                }
                "usersecretnamespace" => opts.user_secret_namespace = value.clone(),
                "imageformat" => {
                    if value != "1" && value != "2" {
                        return Err(invalid(format!(
                            "invalid ceph imageformat {}, expecting 1 or 2",
                            value
                        )));
                    }
                    opts.image_format = value.clone();
                }
                "imagefeatures" => {
                    for feature in value.split(',') {
                        if !SUPPORTED_FEATURES.contains(&feature) {
                            return Err(invalid(format!(
                                "invalid feature {:?}, supported features are: {:?}",
                                feature, SUPPORTED_FEATURES
                            )));
                        }
                        opts.image_features.push(feature.to_string());
                    }
                }
                "fstype" | "csi.storage.k8s.io/fstype" => opts.fs_type = value.clone(),
                _ => return Err(invalid(format!("invalid option {:?}", key))),
            }
        }

        if opts.admin_secret_name.is_empty() {
            return Err(invalid("missing Ceph admin secret name"));
        }
        if opts.user_id.is_empty() {
            opts.user_id = opts.admin_id.clone();
        }
        Ok(opts)
    }
}

/// Looks up StorageClass parameters and Ceph keys.
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait ParamsSource: Send + Sync {
    async fn storage_class_params(&self, name: &str) -> Result<BTreeMap<String, String>>;
    async fn secret_key(&self, namespace: &str, name: &str) -> Result<String>;
}

#[derive(Clone)]
pub struct KubeParamsSource {
    client: Client,
}

impl KubeParamsSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ParamsSource for KubeParamsSource {
    async fn storage_class_params(&self, name: &str) -> Result<BTreeMap<String, String>> {
        let classes: Api<StorageClass> = Api::all(self.client.clone());
        let class =
            classes.get_opt(name).await?.ok_or_else(|| Error::not_found("StorageClass", name))?;
        Ok(class.parameters.unwrap_or_default())
    }

    async fn secret_key(&self, namespace: &str, name: &str) -> Result<String> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets
            .get_opt(name)
            .await?
            .ok_or_else(|| Error::not_found("Secret", format!("{}/{}", namespace, name)))?;

        let data = secret.data.unwrap_or_default();
        let value = data.get(SECRET_KEY).or_else(|| data.values().last()).ok_or_else(|| {
            invalid(format!("secret {}/{} has no {:?} entry", namespace, name, SECRET_KEY))
        })?;
        Ok(String::from_utf8_lossy(&value.0).into_owned())
    }
}

/// [`ImageBackend`] driving `rbd` and `ceph`.
pub struct RbdImages {
    runner: Arc<dyn CommandRunner>,
    params: Arc<dyn ParamsSource>,
    fence_client_id: String,
}

fn arg(s: &str) -> String {
    s.to_string()
}

impl RbdImages {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        params: Arc<dyn ParamsSource>,
        fence_client_id: impl Into<String>,
    ) -> Self {
        Self { runner, params, fence_client_id: fence_client_id.into() }
    }

    async fn options(&self, storage_class: &str) -> Result<(ImageOptions, String)> {
        let params = self.params.storage_class_params(storage_class).await?;
        let opts = ImageOptions::parse(&params)?;
        let key =
            self.params.secret_key(&opts.admin_secret_namespace, &opts.admin_secret_name).await?;
        Ok((opts, key))
    }

    fn connection_args(opts: &ImageOptions, key: &str) -> Vec<String> {
        vec![
            arg("--pool"),
            opts.pool.clone(),
            arg("--id"),
            opts.admin_id.clone(),
            arg("-m"),
            opts.monitors.join(","),
            format!("--key={}", key),
        ]
    }

    /// True when a client still has the image open.
    async fn has_watchers(&self, image: &str, opts: &ImageOptions, key: &str) -> Result<bool> {
        let mut args = vec![arg("status"), arg(image)];
        args.extend(Self::connection_args(opts, key));
        let output = self.runner.run("rbd", &args).await?;
        Ok(output.contains(IMAGE_WATCHER))
    }

    async fn blacklist(&self, op: &str, entity: &str) -> Result<()> {
        let args = vec![
            arg("--id"),
            self.fence_client_id.clone(),
            arg("osd"),
            arg("blacklist"),
            arg(op),
            arg(entity),
        ];
        self.runner.run("ceph", &args).await?;
        Ok(())
    }
}

/// Whole MiB covering `bytes`; `bytes` must be positive.
fn size_in_mib(bytes: i64) -> i64 {
    (bytes - 1) / MIB + 1
}

fn is_missing_image(err: &Error) -> bool {
    matches!(err, Error::Backend(msg) if msg.contains(MISSING_IMAGE))
}

#[async_trait]
impl ImageBackend for RbdImages {
    async fn create_image(&self, storage_class: &str, name: &str, bytes: i64) -> Result<ImageRef> {
        if bytes <= 0 {
            return Err(invalid(format!("invalid volume size {} requested", bytes)));
        }
        let size_mib = size_in_mib(bytes);
        let (opts, key) = self.options(storage_class).await?;

        let mut args = vec![arg("create"), arg(name), arg("--size"), size_mib.to_string()];
        args.extend(Self::connection_args(&opts, &key));
        args.extend([arg("--image-format"), opts.image_format.clone()]);
        if !opts.data_pool.is_empty() {
            args.extend([arg("--data-pool"), opts.data_pool.clone()]);
        }
        if opts.image_format == "2" {
            args.extend([arg("--image-feature"), opts.image_features.join(",")]);
        }

        self.runner.run("rbd", &args).await?;
        info!("Created rbd image {}/{} ({} MiB)", opts.pool, name, size_mib);
        Ok(ImageRef { pool: opts.pool, image: name.to_string() })
    }

    async fn delete_image(&self, storage_class: &str, image: &str) -> Result<()> {
        let (opts, key) = self.options(storage_class).await?;

        match self.has_watchers(image, &opts, &key).await {
            Ok(true) => {
                return Err(Error::Conflict {
                    name: image.to_string(),
                    reason: "rbd image is still being used".to_string(),
                });
            }
            Ok(false) => {}
            Err(e) if is_missing_image(&e) => {
                debug!("rbd image {}/{} already gone", opts.pool, image);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let mut args = vec![arg("rm"), arg(image)];
        args.extend(Self::connection_args(&opts, &key));
        match self.runner.run("rbd", &args).await {
            Ok(_) => {
                info!("Deleted rbd image {}/{}", opts.pool, image);
                Ok(())
            }
            Err(e) if is_missing_image(&e) => Ok(()),
            Err(e) => {
                warn!("Failed to delete rbd image {}/{}: {}", opts.pool, image, e);
                Err(e)
            }
        }
    }

    async fn add_fence(&self, entity: &str) -> Result<()> {
        self.blacklist("add", entity).await?;
        info!("Blacklisted {}", entity);
        Ok(())
    }

    async fn remove_fence(&self, entity: &str) -> Result<()> {
        self.blacklist("rm", entity).await?;
        info!("Removed {} from blacklist", entity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::exec::MockCommandRunner;
    use mockall::predicate::eq;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn fast_rbd() -> BTreeMap<String, String> {
        params(&[
            ("monitors", "10.0.0.1:6789,10.0.0.2:6789"),
            ("adminSecretName", "ceph-admin"),
            ("pool", "fast"),
            ("imageFeatures", "layering"),
        ])
    }

    fn source() -> MockParamsSource {
        let mut source = MockParamsSource::new();
        source.expect_storage_class_params().with(eq("fast-rbd")).returning(|_| Ok(fast_rbd()));
        source
            .expect_secret_key()
            .with(eq("default"), eq("ceph-admin"))
            .returning(|_, _| Ok("AQBsecret==".to_string()));
        source
    }

    #[test]
    fn test_parse_defaults() {
        let opts = ImageOptions::parse(&params(&[("adminsecretname", "s")])).unwrap();
        assert_eq!(opts.pool, "rbd");
        assert_eq!(opts.admin_id, "admin");
        assert_eq!(opts.user_id, "admin");
        assert_eq!(opts.admin_secret_namespace, "default");
        assert_eq!(opts.image_format, "2");
        assert!(opts.image_features.is_empty());
    }

    #[test]
    fn test_parse_full() {
        let opts = ImageOptions::parse(&fast_rbd()).unwrap();
        assert_eq!(opts.monitors, vec!["10.0.0.1:6789", "10.0.0.2:6789"]);
        assert_eq!(opts.pool, "fast");
        assert_eq!(opts.image_features, vec!["layering"]);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        for bad in [
            params(&[("adminsecretname", "s"), ("imageformat", "3")]),
            params(&[("adminsecretname", "s"), ("imagefeatures", "exclusive-lock")]),
            params(&[("adminsecretname", "s"), ("pool", "")]),
            params(&[("adminsecretname", "s"), ("replicas", "3")]),
            params(&[("pool", "fast")]),
        ] {
            let err = ImageOptions::parse(&bad).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_size_in_mib_bounds() {
        assert_eq!(size_in_mib(1), 1);
        assert_eq!(size_in_mib(MIB), 1);
        assert_eq!(size_in_mib(MIB + 1), 2);
        assert_eq!(size_in_mib(10 * 1024 * MIB), 10 * 1024);
        assert_eq!(size_in_mib(i64::MAX), 1 << 43);
    }

    #[tokio::test]
    async fn test_create_image_rounds_up_to_mib() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|program, args| {
                program == "rbd"
                    && args[..4] == ["create", "pvc-1", "--size", "2"]
                    && args.contains(&"--key=AQBsecret==".to_string())
                    && args.ends_with(&["--image-feature".to_string(), "layering".to_string()])
            })
            .times(1)
            .returning(|_, _| Ok(String::new()));

        let rbd = RbdImages::new(Arc::new(runner), Arc::new(source()), "admin");
        let image = rbd.create_image("fast-rbd", "pvc-1", MIB + 1).await.unwrap();
        assert_eq!(image, ImageRef { pool: "fast".to_string(), image: "pvc-1".to_string() });
    }

    #[tokio::test]
    async fn test_create_image_rejects_zero_size() {
        let rbd = RbdImages::new(
            Arc::new(MockCommandRunner::new()),
            Arc::new(MockParamsSource::new()),
            "admin",
        );
        let err = rbd.create_image("fast-rbd", "pvc-1", 0).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_delete_image_refuses_watched_image() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|_, args| args[0] == "status")
            .returning(|_, _| Ok("Watchers:\n\twatcher=10.0.0.9:0/1 client.1 cookie=1\n".to_string()));

        let rbd = RbdImages::new(Arc::new(runner), Arc::new(source()), "admin");
        let err = rbd.delete_image("fast-rbd", "pvc-1").await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_delete_missing_image_is_success() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().withf(|_, args| args[0] == "status").returning(|_, _| {
            Err(Error::Backend("rbd: error opening image pvc-1: (2) No such file or directory".to_string()))
        });

        let rbd = RbdImages::new(Arc::new(runner), Arc::new(source()), "admin");
        rbd.delete_image("fast-rbd", "pvc-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_image_removes_unwatched_image() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|_, args| args[0] == "status")
            .times(1)
            .returning(|_, _| Ok("Watchers: none\n".to_string()));
        runner
            .expect_run()
            .withf(|_, args| args[0] == "rm" && args[1] == "pvc-1")
            .times(1)
            .returning(|_, _| Ok(String::new()));

        let rbd = RbdImages::new(Arc::new(runner), Arc::new(source()), "admin");
        rbd.delete_image("fast-rbd", "pvc-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_fence_commands() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|program, args| {
                program == "ceph" && args.join(" ") == "--id csi-alcub osd blacklist add 10.0.0.5:0/0"
            })
            .times(1)
            .returning(|_, _| Ok(String::new()));
        runner
            .expect_run()
            .withf(|_, args| args.join(" ") == "--id csi-alcub osd blacklist rm 10.0.0.5:0/0")
            .times(1)
            .returning(|_, _| Ok(String::new()));

        let rbd = RbdImages::new(Arc::new(runner), Arc::new(MockParamsSource::new()), "csi-alcub");
        rbd.add_fence("10.0.0.5:0/0").await.unwrap();
        rbd.remove_fence("10.0.0.5:0/0").await.unwrap();
    }
}
