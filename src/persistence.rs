//! Database persistence layer for the block store

use crate::blockchain::SkipBlock;
use crate::error::ChainError;
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

/// Abstraction for persistence backends. A block handed to `save_block` must
/// be durable when the call returns; saving a block again replaces it.
pub trait Persistence: Send + Sync {
    fn save_block(&self, block: &SkipBlock) -> Result<(), ChainError>;
    fn load_blocks(&self) -> Result<Vec<SkipBlock>, ChainError>;
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self, ChainError> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                hash BLOB PRIMARY KEY,
                skipchain_id BLOB NOT NULL,
                block_index INTEGER NOT NULL,
                block BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create blocks table: {}", e)))?;

        Ok(Database { conn: Mutex::new(conn) })
    }

    pub fn save_block(&self, block: &SkipBlock) -> Result<(), ChainError> {
        let encoded = bincode::serialize(block)?;

        let conn = self.conn.lock().map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO blocks (hash, skipchain_id, block_index, block)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                block.hash.to_vec(),
                block.skipchain_id().to_vec(),
                block.index as i64,
                encoded,
            ],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save block: {}", e)))?;

        Ok(())
    }

    pub fn load_blocks(&self) -> Result<Vec<SkipBlock>, ChainError> {
        let conn = self.conn.lock().map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))?;
        let mut stmt = conn
            .prepare("SELECT block FROM blocks ORDER BY skipchain_id, block_index ASC")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query blocks: {}", e)))?;

        let mut blocks = Vec::new();
        for row in rows {
            let bytes = row.map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?;
            blocks.push(bincode::deserialize(&bytes)?);
        }
        Ok(blocks)
    }
}

impl Persistence for Database {
    fn save_block(&self, block: &SkipBlock) -> Result<(), ChainError> {
        Database::save_block(self, block)
    }

    fn load_blocks(&self) -> Result<Vec<SkipBlock>, ChainError> {
        Database::load_blocks(self)
    }
}

/// Simple in-memory persistence implementation useful for tests and ephemeral runs.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    pub blocks: Arc<Mutex<Vec<SkipBlock>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for InMemoryPersistence {
    fn save_block(&self, block: &SkipBlock) -> Result<(), ChainError> {
        let mut blocks = self.blocks.lock().map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))?;
        blocks.retain(|b| b.hash != block.hash);
        blocks.push(block.clone());
        Ok(())
    }

    fn load_blocks(&self) -> Result<Vec<SkipBlock>, ChainError> {
        let blocks = self.blocks.lock().map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))?;
        Ok(blocks.clone())
    }
}
