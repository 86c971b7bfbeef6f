use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::forwarder::ForwardingServer;

/// 本地代理 URL -> 转发服务器 的注册表
///
/// 所有插入、删除和查找都在同一把锁内完成，且从不跨越 await 持有锁。
#[derive(Default)]
pub struct ProxyRegistry {
    servers: Mutex<HashMap<String, Arc<dyn ForwardingServer>>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入一条记录；key 已存在时不覆盖并返回 false
    pub fn insert(&self, url: String, server: Arc<dyn ForwardingServer>) -> bool {
        let mut servers = self.servers.lock();
        if servers.contains_key(&url) {
            return false;
        }
        servers.insert(url, server);
        true
    }

    pub fn get(&self, url: &str) -> Option<Arc<dyn ForwardingServer>> {
        self.servers.lock().get(url).cloned()
    }

    pub fn remove(&self, url: &str) -> Option<Arc<dyn ForwardingServer>> {
        self.servers.lock().remove(url)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.servers.lock().contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.servers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 当前所有已注册的本地代理 URL
    pub fn urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.servers.lock().keys().cloned().collect();
        urls.sort();
        urls
    }
}

impl std::fmt::Debug for ProxyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRegistry")
            .field("urls", &self.urls())
            .finish()
    }
}
