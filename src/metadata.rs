//! Metadata store seam (§6 supplement): a trait over the external relational
//! collaborator, plus an in-memory reference implementation used by tests and
//! simple deployments.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::types::{Document, DocumentStructure, KnowledgeBase, Status};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_kb(&self, kb: KnowledgeBase) -> Result<()>;
    async fn get_kb(&self, id: Uuid) -> Result<KnowledgeBase>;
    async fn soft_delete_kb(&self, id: Uuid) -> Result<()>;

    /// Recomputes `document_count`/`total_chunks` from the live documents table —
    /// counters are never incremented directly (§3 invariant).
    async fn recompute_kb_counters(&self, id: Uuid) -> Result<()>;

    async fn create_document(&self, document: Document) -> Result<()>;
    async fn get_document(&self, id: Uuid) -> Result<Document>;
    async fn find_document_by_hash(&self, kb_id: Uuid, content_hash: &str) -> Result<Option<Document>>;
    async fn list_documents(&self, kb_id: Uuid) -> Result<Vec<Document>>;
    async fn update_document(&self, document: Document) -> Result<()>;
    async fn soft_delete_document(&self, id: Uuid) -> Result<()>;
    async fn restore_document(&self, id: Uuid) -> Result<()>;

    async fn put_structure(&self, structure: DocumentStructure) -> Result<()>;
    async fn get_structure(&self, document_id: Uuid) -> Result<Option<DocumentStructure>>;
}

#[derive(Default)]
struct Inner {
    kbs: HashMap<Uuid, KnowledgeBase>,
    documents: HashMap<Uuid, Document>,
    structures: HashMap<Uuid, DocumentStructure>,
}

pub struct InMemoryMetadataStore {
    inner: Mutex<Inner>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn create_kb(&self, kb: KnowledgeBase) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.kbs.contains_key(&kb.id) {
            return Err(EngineError::Conflict(format!("knowledge base {} already exists", kb.id)));
        }
        inner.kbs.insert(kb.id, kb);
        Ok(())
    }

    async fn get_kb(&self, id: Uuid) -> Result<KnowledgeBase> {
        self.inner.lock().kbs.get(&id).cloned().ok_or_else(|| EngineError::NotFound(format!("knowledge base {id}")))
    }

    async fn soft_delete_kb(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        let kb = inner.kbs.get_mut(&id).ok_or_else(|| EngineError::NotFound(format!("knowledge base {id}")))?;
        kb.deleted = true;
        Ok(())
    }

    async fn recompute_kb_counters(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.kbs.contains_key(&id) {
            return Err(EngineError::NotFound(format!("knowledge base {id}")));
        }
        let (document_count, total_chunks) = {
            let docs: Vec<&Document> = inner.documents.values().filter(|d| d.knowledge_base_id == id && !d.deleted).collect();
            (docs.len() as u64, docs.iter().map(|d| d.chunk_count).sum())
        };
        let kb = inner.kbs.get_mut(&id).expect("checked above");
        kb.document_count = document_count;
        kb.total_chunks = total_chunks;
        Ok(())
    }

    async fn create_document(&self, document: Document) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.documents.contains_key(&document.id) {
            return Err(EngineError::Conflict(format!("document {} already exists", document.id)));
        }
        inner.documents.insert(document.id, document);
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> Result<Document> {
        self.inner.lock().documents.get(&id).cloned().ok_or_else(|| EngineError::NotFound(format!("document {id}")))
    }

    async fn find_document_by_hash(&self, kb_id: Uuid, content_hash: &str) -> Result<Option<Document>> {
        let inner = self.inner.lock();
        Ok(inner
            .documents
            .values()
            .find(|d| d.knowledge_base_id == kb_id && d.content_hash == content_hash && !d.deleted)
            .cloned())
    }

    async fn list_documents(&self, kb_id: Uuid) -> Result<Vec<Document>> {
        let inner = self.inner.lock();
        Ok(inner.documents.values().filter(|d| d.knowledge_base_id == kb_id && !d.deleted).cloned().collect())
    }

    async fn update_document(&self, document: Document) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.documents.contains_key(&document.id) {
            return Err(EngineError::NotFound(format!("document {}", document.id)));
        }
        inner.documents.insert(document.id, document);
        Ok(())
    }

    async fn soft_delete_document(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        let document = inner.documents.get_mut(&id).ok_or_else(|| EngineError::NotFound(format!("document {id}")))?;
        document.deleted = true;
        Ok(())
    }

    async fn restore_document(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        let document = inner.documents.get_mut(&id).ok_or_else(|| EngineError::NotFound(format!("document {id}")))?;
        document.deleted = false;
        document.embeddings_status = Status::Pending;
        document.bm25_status = Status::Pending;
        document.progress = 0;
        Ok(())
    }

    async fn put_structure(&self, structure: DocumentStructure) -> Result<()> {
        self.inner.lock().structures.insert(structure.document_id, structure);
        Ok(())
    }

    async fn get_structure(&self, document_id: Uuid) -> Result<Option<DocumentStructure>> {
        Ok(self.inner.lock().structures.get(&document_id).cloned())
    }
}
