use crate::domain::post::Post;
use anyhow::Context;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// File-backed post collection.
///
/// Every write replaces the whole file through a temp-file-then-rename swap,
/// so readers never observe a partially written document. A single mutex
/// serializes all read-modify-write cycles; external engine and price-feed
/// calls must never happen while it is held.
pub struct PostStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PostStore {
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create data directory {} failed", parent.display()))?;
            }
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Missing or corrupt backing file reads as an empty collection.
    async fn read_all(&self) -> Vec<Post> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_slice(&bytes) {
            Ok(posts) => posts,
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "post store unreadable; treating as empty"
                );
                Vec::new()
            }
        }
    }

    async fn write_all(&self, posts: &[Post]) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(posts).context("serialize posts failed")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("write {} failed", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("rename into {} failed", self.path.display()))?;
        Ok(())
    }

    pub async fn list(&self) -> Vec<Post> {
        let _guard = self.lock.lock().await;
        self.read_all().await
    }

    pub async fn find(&self, id: &str) -> Option<Post> {
        self.list().await.into_iter().find(|p| p.id == id)
    }

    pub async fn insert(&self, post: Post) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut posts = self.read_all().await;
        posts.push(post);
        self.write_all(&posts).await
    }

    /// Locked read-modify-write for a single post. Returns whether the post
    /// existed; the mutator runs only when it does.
    pub async fn transaction<F>(&self, id: &str, mutate: F) -> anyhow::Result<bool>
    where
        F: FnOnce(&mut Post),
    {
        let _guard = self.lock.lock().await;
        let mut posts = self.read_all().await;
        let Some(post) = posts.iter_mut().find(|p| p.id == id) else {
            return Ok(false);
        };
        mutate(post);
        self.write_all(&posts).await?;
        Ok(true)
    }

    pub async fn remove(&self, id: &str) -> anyhow::Result<bool> {
        let _guard = self.lock.lock().await;
        let mut posts = self.read_all().await;
        let before = posts.len();
        posts.retain(|p| p.id != id);
        if posts.len() == before {
            return Ok(false);
        }
        self.write_all(&posts).await?;
        Ok(true)
    }

    /// Persist a new ordering: listed ids first, in the given order (unknown
    /// and duplicate ids ignored), then any omitted posts in their prior
    /// relative order. Returns the resulting id order.
    pub async fn reorder(&self, order: &[String]) -> anyhow::Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        let posts = self.read_all().await;

        let mut remaining: Vec<Option<Post>> = posts.into_iter().map(Some).collect();
        let mut reordered = Vec::with_capacity(remaining.len());
        for id in order {
            if let Some(slot) = remaining
                .iter_mut()
                .find(|slot| slot.as_ref().is_some_and(|p| &p.id == id))
            {
                reordered.push(slot.take().context("post vanished during reorder")?);
            }
        }
        reordered.extend(remaining.into_iter().flatten());

        self.write_all(&reordered).await?;
        Ok(reordered.into_iter().map(|p| p.id).collect())
    }
}
