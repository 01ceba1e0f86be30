//! Single-use, expiring registry of prepared requests keyed by random tokens

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;

use crate::error::{Error, Result};

const MAX_TOKEN_TRIES: usize = 10;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct Entry<T> {
    req: T,
    expire: Instant,
}

struct Inner<T> {
    entries: HashMap<String, Entry<T>>,
    /// Tokens in insertion order; consumed tokens stay here until GC reaches them
    order: VecDeque<(String, Instant)>,
}

pub struct RequestCache<T> {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    max_in_flight: usize,
    token_len: usize,
    inner: Mutex<Inner<T>>,
}

impl<T> RequestCache<T> {
    pub fn new(ttl: Duration, max_in_flight: usize, token_len: usize) -> Self {
        Self::with_clock(ttl, max_in_flight, token_len, Arc::new(SystemClock))
    }

    pub fn with_clock(
        ttl: Duration,
        max_in_flight: usize,
        token_len: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            clock,
            ttl,
            max_in_flight,
            token_len: token_len.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Store `req` and return the token that retrieves it
    pub fn insert(&self, req: T) -> Result<String> {
        let now = self.clock.now();
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::Internal("request cache lock poisoned".to_string()))?;

        gc(&mut inner, now);
        if inner.entries.len() >= self.max_in_flight {
            return Err(Error::TooManyInFlight(self.ttl.as_secs().max(1)));
        }

        let token = self.unique_token(&inner)?;
        let expire = now + self.ttl;
        inner.order.push_back((token.clone(), expire));
        inner.entries.insert(token.clone(), Entry { req, expire });
        Ok(token)
    }

    /// Remove and return the request behind `token`; expired entries are never returned
    pub fn consume(&self, token: &str) -> Result<T> {
        let now = self.clock.now();
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::Internal("request cache lock poisoned".to_string()))?;

        let entry = inner.entries.remove(token).ok_or(Error::TokenNotFound)?;
        if now > entry.expire {
            return Err(Error::TokenNotFound);
        }
        Ok(entry.req)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().expect("request cache lock").entries.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unique_token(&self, inner: &Inner<T>) -> Result<String> {
        // Enough random bytes to yield token_len base64 characters
        let raw_len = (self.token_len * 6).div_ceil(8);
        let mut raw = vec![0u8; raw_len];
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_TOKEN_TRIES {
            rng.fill_bytes(&mut raw);
            let mut token = URL_SAFE_NO_PAD.encode(&raw);
            token.truncate(self.token_len);
            if !inner.entries.contains_key(&token) {
                return Ok(token);
            }
        }
        Err(Error::TokenGeneration)
    }
}

/// Drop expired entries from the old end of the queue
fn gc<T>(inner: &mut Inner<T>, now: Instant) {
    while let Some((token, expire)) = inner.order.front() {
        let consumed = inner
            .entries
            .get(token)
            .map(|entry| entry.expire != *expire)
            .unwrap_or(true);
        if !consumed && now <= *expire {
            return;
        }
        if !consumed {
            inner.entries.remove(token);
        }
        inner.order.pop_front();
    }
}
