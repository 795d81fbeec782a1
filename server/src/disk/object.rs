use async_trait::async_trait;
use bytes::Bytes;
use opendal::{services::S3, ErrorKind, Operator};

use crate::config::{BackendConfig, Visibility};
use crate::disk::DiskBackend;
use crate::error::{DiskError, DiskErrorKind};

/// S3 compatible object store disk.
pub struct ObjectStoreDisk {
    name: String,
    operator: Operator,
    public_url: Option<String>,
}

impl ObjectStoreDisk {
    pub fn from_config(name: &str, config: &BackendConfig) -> Result<Self, DiskError> {
        let BackendConfig::S3 {
            bucket,
            endpoint,
            region,
            root,
            access_key_id,
            secret_access_key,
            public_url,
        } = config
        else {
            return Err(DiskError::new(
                name,
                DiskErrorKind::ConfigMissing,
                "not an object store disk",
            ));
        };

        let Some(bucket) = bucket.as_deref().filter(|b| !b.is_empty()) else {
            return Err(DiskError::new(
                name,
                DiskErrorKind::ConfigMissing,
                "bucket is not configured",
            ));
        };

        let mut builder = S3::default();
        builder.bucket(bucket);
        if let Some(endpoint) = endpoint {
            builder.endpoint(endpoint);
        }
        if let Some(region) = region {
            builder.region(region);
        }
        if let Some(root) = root {
            builder.root(root);
        }
        match (access_key_id, secret_access_key) {
            (Some(key), Some(secret)) => {
                builder.access_key_id(key).secret_access_key(secret);
            }
            _ => {
                builder.allow_anonymous();
            }
        }

        let operator = Operator::new(builder)
            .map_err(|e| classify(name, &e))?
            .finish();

        Ok(Self {
            name: name.to_owned(),
            operator,
            public_url: public_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_owned()),
        })
    }
}

/// Buckets own their access policy, per object the visibility only decides who may cache
/// it. Keys are never reused, so public objects are immutable.
fn cache_control(visibility: Visibility) -> &'static str {
    match visibility {
        Visibility::Public => "public, max-age=31536000, immutable",
        Visibility::Private => "private, no-store",
    }
}

fn classify(disk: &str, e: &opendal::Error) -> DiskError {
    let kind = match e.kind() {
        ErrorKind::ConfigInvalid => DiskErrorKind::ConfigMissing,
        ErrorKind::RateLimited => DiskErrorKind::QuotaExceeded,
        _ => DiskErrorKind::IoFailure,
    };
    DiskError::new(disk, kind, e.to_string())
}

#[async_trait]
impl DiskBackend for ObjectStoreDisk {
    async fn put(&self, key: &str, bytes: Bytes, visibility: Visibility) -> Result<(), DiskError> {
        // A single PUT is atomic on S3, the object appears only once fully uploaded
        self.operator
            .write_with(key, bytes)
            .cache_control(cache_control(visibility))
            .await
            .map_err(|e| classify(&self.name, &e))
    }

    fn url(&self, key: &str) -> String {
        match &self.public_url {
            Some(base) => format!("{base}/{key}"),
            None => key.to_owned(),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, DiskError> {
        self.operator
            .is_exist(key)
            .await
            .map_err(|e| classify(&self.name, &e))
    }

    async fn delete(&self, key: &str) -> Result<(), DiskError> {
        self.operator
            .delete(key)
            .await
            .map_err(|e| classify(&self.name, &e))
    }
}
