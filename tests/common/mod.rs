// tests/common/mod.rs

//! A toy in-memory key-value store implementing the [`Dispatcher`] and
//! [`DatasetSource`] collaborators (spec.md §1's external seams), just
//! sufficient to exercise the AOF engine's round-trip and rewrite behavior
//! end to end without pulling in a real data-type layer.

use bytes::Bytes;
use spineldb_aof::{AofError, DatasetSource, Dispatcher, KeyExport, ReplayContext};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct ToyStore {
    dbs: Mutex<Vec<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl ToyStore {
    pub fn new(db_count: usize) -> Self {
        Self {
            dbs: Mutex::new(vec![HashMap::new(); db_count]),
        }
    }

    pub fn get(&self, db_index: usize, key: &str) -> Option<String> {
        self.dbs.lock().unwrap()[db_index]
            .get(key.as_bytes())
            .map(|v| String::from_utf8_lossy(v).to_string())
    }

    pub fn len(&self, db_index: usize) -> usize {
        self.dbs.lock().unwrap()[db_index].len()
    }
}

fn argstr(arg: &Bytes) -> String {
    String::from_utf8_lossy(arg).to_string()
}

impl Dispatcher for ToyStore {
    fn dispatch(&self, ctx: &ReplayContext, argv: &Vec<Bytes>) -> Result<(), AofError> {
        let mut dbs = self.dbs.lock().unwrap();
        let db = dbs
            .get_mut(ctx.db_index)
            .ok_or_else(|| AofError::UnknownCommand(format!("no such database {}", ctx.db_index)))?;

        let Some(verb) = argv.first() else {
            return Err(AofError::UnknownCommand("empty command".into()));
        };

        if verb.eq_ignore_ascii_case(b"SET") {
            let key = argv.get(1).ok_or_else(|| AofError::UnknownCommand("SET missing key".into()))?;
            let value = argv.get(2).ok_or_else(|| AofError::UnknownCommand("SET missing value".into()))?;
            db.insert(key.to_vec(), value.to_vec());
            Ok(())
        } else if verb.eq_ignore_ascii_case(b"DEL") {
            let key = argv.get(1).ok_or_else(|| AofError::UnknownCommand("DEL missing key".into()))?;
            db.remove(key.as_ref());
            Ok(())
        } else if verb.eq_ignore_ascii_case(b"PEXPIREAT") {
            // TTLs are not modeled by this toy store; accept and ignore.
            Ok(())
        } else {
            Err(AofError::UnknownCommand(argstr(verb)))
        }
    }

    fn database_count(&self) -> usize {
        self.dbs.lock().unwrap().len()
    }
}

impl DatasetSource for ToyStore {
    fn database_count(&self) -> usize {
        self.dbs.lock().unwrap().len()
    }

    fn export_database(&self, db_index: usize) -> Vec<KeyExport> {
        let dbs = self.dbs.lock().unwrap();
        dbs[db_index]
            .iter()
            .map(|(key, value)| KeyExport {
                key: Bytes::copy_from_slice(key),
                commands: vec![vec![
                    Bytes::from_static(b"SET"),
                    Bytes::copy_from_slice(key),
                    Bytes::copy_from_slice(value),
                ]],
                expire_at_ms: None,
            })
            .collect()
    }
}

pub fn argv(words: &[&str]) -> Vec<Bytes> {
    words.iter().map(|w| Bytes::copy_from_slice(w.as_bytes())).collect()
}
