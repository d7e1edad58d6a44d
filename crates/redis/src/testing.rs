//! In-process `RedisLike` fake shared by this crate's tests.
#![allow(clippy::expect_used)]

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use {async_trait::async_trait, switchboard_pubsub::StopHandle};

use crate::like::{MessageHandler, RedisError, RedisLike, RedisResult, RedisValue};

#[derive(Default)]
pub struct FakeRedis {
    published: Mutex<Vec<(String, String)>>,
    handlers: Arc<Mutex<Vec<(usize, String, MessageHandler)>>>,
    next_handler_id: AtomicUsize,
    scripts: Mutex<HashSet<String>>,
    script_loads: Mutex<Vec<String>>,
    evalsha_calls: Mutex<Vec<(String, Vec<String>, Vec<String>)>>,
    evalsha_responses: Mutex<VecDeque<RedisResult<RedisValue>>>,
    fail_publish: AtomicBool,
}

impl FakeRedis {
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().expect("lock").clone()
    }

    pub fn patterns(&self) -> Vec<String> {
        self.handlers
            .lock()
            .expect("lock")
            .iter()
            .map(|(_, pattern, _)| pattern.clone())
            .collect()
    }

    pub fn fail_publishes(&self) {
        self.fail_publish.store(true, Ordering::SeqCst);
    }

    /// Deliver a broker frame to every matching subscription.
    pub fn emit(&self, channel: &str, message: &str) {
        let handlers: Vec<MessageHandler> = self
            .handlers
            .lock()
            .expect("lock")
            .iter()
            .filter(|(_, pattern, _)| pattern_matches(pattern, channel))
            .map(|(_, _, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(channel.to_string(), message.to_string());
        }
    }

    pub fn flush_scripts(&self) {
        self.scripts.lock().expect("lock").clear();
    }

    pub fn script_load_count(&self) -> usize {
        self.script_loads.lock().expect("lock").len()
    }

    pub fn push_evalsha_response(&self, response: RedisResult<RedisValue>) {
        self.evalsha_responses.lock().expect("lock").push_back(response);
    }

    pub fn evalsha_calls(&self) -> Vec<(String, Vec<String>, Vec<String>)> {
        self.evalsha_calls.lock().expect("lock").clone()
    }

    fn register(&self, pattern: String, handler: MessageHandler) -> StopHandle {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().expect("lock").push((id, pattern, handler));
        let handlers = self.handlers.clone();
        StopHandle::new(async move {
            handlers.lock().expect("lock").retain(|(hid, _, _)| *hid != id);
        })
    }
}

fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

#[async_trait]
impl RedisLike for FakeRedis {
    async fn publish(&self, channel: &str, message: &str) -> RedisResult<u64> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(RedisError::Connection {
                message: "broken pipe".into(),
            });
        }
        self.published
            .lock()
            .expect("lock")
            .push((channel.to_string(), message.to_string()));
        Ok(0)
    }

    async fn psubscribe(
        &self,
        pattern: &str,
        handler: MessageHandler,
    ) -> RedisResult<StopHandle> {
        Ok(self.register(pattern.to_string(), handler))
    }

    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> RedisResult<StopHandle> {
        Ok(self.register(channel.to_string(), handler))
    }

    async fn script_load(&self, script: &str) -> RedisResult<String> {
        let sha = format!("sha-{}", script.len());
        self.script_loads.lock().expect("lock").push(sha.clone());
        self.scripts.lock().expect("lock").insert(sha.clone());
        Ok(sha)
    }

    async fn evalsha(
        &self,
        sha: &str,
        keys: &[&str],
        args: &[String],
    ) -> RedisResult<RedisValue> {
        if !self.scripts.lock().expect("lock").contains(sha) {
            return Err(RedisError::NoScript);
        }
        self.evalsha_calls.lock().expect("lock").push((
            sha.to_string(),
            keys.iter().map(|k| k.to_string()).collect(),
            args.to_vec(),
        ));
        if let Some(response) = self.evalsha_responses.lock().expect("lock").pop_front() {
            return response;
        }
        Ok(RedisValue::Array(vec![RedisValue::Int(1), RedisValue::Int(0)]))
    }
}
