//! Sealed secret material with scoped access.
//!
//! A [Guarded] value stays sealed while nobody looks at it. [Guarded::access] hands out a guard;
//! the first outstanding guard unseals the value and dropping the last one seals it again.
//! Guards are taken under a reentrant lock, so one thread may nest them freely while other
//! threads wait for their turn.

use std::cell::{Cell, Ref, RefCell};
use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use primitive_types::H256;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::common::keccak256;

pub trait Sensitive {
    fn seal(&mut self);
    fn unseal(&mut self);
    fn sealed(&self) -> bool;
}

struct Slot<T> {
    value: RefCell<T>,
    refs: Cell<usize>,
}

pub struct Guarded<T: Sensitive> {
    slot: Arc<ReentrantMutex<Slot<T>>>,
}

impl<T: Sensitive> Clone for Guarded<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Sensitive> Guarded<T> {
    pub fn new(mut value: T) -> Self {
        value.seal();
        Self {
            slot: Arc::new(ReentrantMutex::new(Slot {
                value: RefCell::new(value),
                refs: Cell::new(0),
            })),
        }
    }

    pub fn access(&self) -> Guard<'_, T> {
        let lock = self.slot.lock();
        let refs = lock.refs.get();
        if refs == 0 {
            lock.value.borrow_mut().unseal();
        }
        lock.refs.set(refs + 1);
        Guard { lock }
    }

    pub fn is_sealed(&self) -> bool {
        self.slot.lock().value.borrow().sealed()
    }
}

pub struct Guard<'a, T: Sensitive> {
    lock: ReentrantMutexGuard<'a, Slot<T>>,
}

impl<'a, T: Sensitive> Guard<'a, T> {
    #[inline(always)]
    pub fn get(&self) -> Ref<'_, T> {
        self.lock.value.borrow()
    }
}

impl<'a, T: Sensitive> Drop for Guard<'a, T> {
    fn drop(&mut self) {
        let refs = self.lock.refs.get() - 1;
        self.lock.refs.set(refs);
        if refs == 0 {
            self.lock.value.borrow_mut().seal();
        }
    }
}

/// Signing secret of a sigchain, XOR-masked with a random pad while sealed. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    secret: Vec<u8>,
    pad: Vec<u8>,
    #[zeroize(skip)]
    sealed: bool,
}

impl Credentials {
    pub fn new(secret: &[u8]) -> Self {
        let mut pad = vec![0u8; secret.len()];
        rand::thread_rng().fill_bytes(&mut pad);
        Self {
            secret: secret.to_vec(),
            pad,
            sealed: false,
        }
    }

    /// Commitment to the key of transaction `sequence`. Unavailable while sealed.
    pub fn generate(&self, sequence: u32) -> Option<H256> {
        if self.sealed {
            return None
        }
        let mut buf = Zeroizing::new(Vec::with_capacity(self.secret.len() + 4));
        buf.extend_from_slice(&self.secret);
        buf.extend_from_slice(&sequence.to_le_bytes());
        Some(keccak256(&buf))
    }

    fn mask(&mut self) {
        for (s, p) in self.secret.iter_mut().zip(self.pad.iter()) {
            *s ^= *p
        }
    }
}

impl Sensitive for Credentials {
    fn seal(&mut self) {
        if !self.sealed {
            self.mask();
            self.sealed = true;
        }
    }

    fn unseal(&mut self) {
        if self.sealed {
            self.mask();
            self.sealed = false;
        }
    }

    fn sealed(&self) -> bool {
        self.sealed
    }
}

#[test]
fn test_guard_seals_on_last_drop() {
    let creds = Guarded::new(Credentials::new(b"correct horse"));
    assert!(creds.is_sealed());
    let expected = keccak256(b"correct horse\x05\x00\x00\x00");
    {
        let outer = creds.access();
        assert!(!creds.is_sealed());
        {
            let inner = creds.clone();
            let g = inner.access();
            assert_eq!(g.get().generate(5), Some(expected));
        }
        // still held by the outer guard
        assert!(!creds.is_sealed());
        assert_eq!(outer.get().generate(5), Some(expected));
    }
    assert!(creds.is_sealed());
    // the mask is undone exactly on the next access
    assert_eq!(creds.access().get().generate(5), Some(expected));
}

#[test]
fn test_sealed_credentials_refuse() {
    let mut creds = Credentials::new(b"secret");
    creds.seal();
    assert_eq!(creds.generate(1), None);
    creds.unseal();
    assert!(creds.generate(1).is_some());
}

#[test]
fn test_zeroize_wipes_secret() {
    let mut creds = Credentials::new(b"wipe me");
    creds.seal();
    creds.zeroize();
    assert!(creds.secret.is_empty());
    assert!(creds.pad.is_empty());
    assert_eq!(creds.generate(0), None);
}

#[test]
fn test_guard_across_threads() {
    let creds = Guarded::new(Credentials::new(b"shared"));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let creds = creds.clone();
            std::thread::spawn(move || {
                let key = creds.access().get().generate(i);
                key.is_some()
            })
        })
        .collect();
    for h in handles {
        assert!(h.join().unwrap());
    }
    assert!(creds.is_sealed());
}
