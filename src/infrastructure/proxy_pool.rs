//! Proxy pool loaded from a line-oriented file

use std::path::Path;
use tracing::{info, warn};

use crate::domain::proxy::ProxyDescriptor;

/// Ordered proxy descriptors; blank, comment and malformed lines never make it in
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyPool {
    proxies: Vec<ProxyDescriptor>,
}

impl ProxyPool {
    /// Read and parse the whole file. Any read failure yields an empty pool.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let pool = Self::from_lines(&content);
                info!("🌐 Loaded {} proxies from {}", pool.len(), path.display());
                pool
            }
            Err(e) => {
                warn!("⚠️  Proxy file {} could not be read: {}", path.display(), e);
                Self::default()
            }
        }
    }

    #[must_use]
    pub fn from_lines(content: &str) -> Self {
        let proxies = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(ProxyDescriptor::parse)
            .collect();
        Self { proxies }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    #[must_use]
    pub fn first(&self) -> Option<&ProxyDescriptor> {
        self.proxies.first()
    }

    /// Uniformly chosen entry
    #[must_use]
    pub fn random(&self) -> Option<&ProxyDescriptor> {
        if self.proxies.is_empty() {
            return None;
        }
        self.proxies.get(fastrand::usize(..self.proxies.len()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProxyDescriptor> {
        self.proxies.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const POOL: &str = "\
# primary
1.2.3.4:8000:user:secret

socks5://5.6.7.8:1080
not a proxy
   # indented comment
user:pass@9.9.9.9:3128
";

    #[test]
    fn skips_comments_blanks_and_malformed_lines() {
        let pool = ProxyPool::from_lines(POOL);
        assert_eq!(pool.len(), 3);
        let hosts: Vec<_> = pool.iter().map(|p| p.host.as_str()).collect();
        assert_eq!(hosts, vec!["1.2.3.4", "5.6.7.8", "9.9.9.9"]);
        assert_eq!(pool.first().and_then(ProxyDescriptor::username), Some("user"));
    }

    #[test]
    fn loads_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(POOL.as_bytes()).unwrap();
        let pool = ProxyPool::load(file.path());
        assert_eq!(pool.len(), 3);
        assert!(pool.random().is_some());
    }

    #[test]
    fn missing_file_yields_empty_pool() {
        let pool = ProxyPool::load("/definitely/not/here/proxies.txt");
        assert!(pool.is_empty());
        assert!(pool.first().is_none());
        assert!(pool.random().is_none());
    }
}
