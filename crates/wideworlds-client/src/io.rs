use crate::net::{NetError, WorldServer};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use wideworlds_cache::ChunkCache;
use wideworlds_entity::Sequence;
use wideworlds_protocol::BatchStatus;
use wideworlds_types::{ChunkPos, PagePos, Prop, PropUpdate};
use wideworlds_world::{TerrainPageData, WaterPageData};

/// A batched prop write, as sent to the server.
#[derive(Debug, Clone)]
pub enum PropBatch {
    Create(Vec<Prop>),
    Update(Vec<PropUpdate>),
    Delete(Vec<u32>),
}

/// Requests the runtime sends to the I/O task.
#[derive(Debug)]
pub enum IoRequest {
    /// Fetch one chunk's props. `lazy` consults the local cache first.
    FetchChunk {
        generation: u64,
        pos: ChunkPos,
        hide: bool,
        lazy: bool,
    },
    FetchTerrainPage {
        generation: u64,
        pos: PagePos,
    },
    FetchWaterPage {
        generation: u64,
        pos: PagePos,
    },
    FetchSequence {
        hash: u16,
        file: String,
    },
    PropBatch {
        batch_id: u64,
        batch: PropBatch,
    },
}

/// Results the I/O task posts back; the runtime drains these at the
/// start of each tick.
#[derive(Debug)]
pub enum Completion {
    ChunkLoaded {
        generation: u64,
        pos: ChunkPos,
        hide: bool,
        props: Vec<Prop>,
    },
    ChunkFailed {
        generation: u64,
        pos: ChunkPos,
        error: String,
    },
    TerrainPageLoaded {
        generation: u64,
        pos: PagePos,
        data: TerrainPageData,
    },
    WaterPageLoaded {
        generation: u64,
        pos: PagePos,
        data: WaterPageData,
    },
    PageFailed {
        generation: u64,
        pos: PagePos,
        error: String,
    },
    SequenceLoaded {
        hash: u16,
        sequence: Option<Sequence>,
    },
    BatchDone {
        batch_id: u64,
        status: BatchStatus,
    },
    BatchFailed {
        batch_id: u64,
        error: String,
    },
}

/// Serves runtime I/O requests: the chunk cache lives here, off the
/// tick path, together with the REST client. Requests are handled in
/// order; the tick loop never blocks on any of this.
pub async fn run_io_task<W: WorldServer>(
    client: W,
    world_id: u32,
    chunk_side: f32,
    path_base: String,
    mut cache: ChunkCache,
    mut rx: mpsc::UnboundedReceiver<IoRequest>,
    tx: mpsc::UnboundedSender<Completion>,
) {
    while let Some(request) = rx.recv().await {
        let completion = match request {
            IoRequest::FetchChunk {
                generation,
                pos,
                hide,
                lazy,
            } => fetch_chunk(&client, world_id, chunk_side, &mut cache, generation, pos, hide, lazy).await,
            IoRequest::FetchTerrainPage { generation, pos } => {
                match client.terrain_page(world_id, pos.px, pos.pz).await {
                    Ok(data) => Completion::TerrainPageLoaded {
                        generation,
                        pos,
                        data,
                    },
                    Err(e) => Completion::PageFailed {
                        generation,
                        pos,
                        error: e.to_string(),
                    },
                }
            }
            IoRequest::FetchWaterPage { generation, pos } => {
                match client.water_page(world_id, pos.px, pos.pz).await {
                    Ok(data) => Completion::WaterPageLoaded {
                        generation,
                        pos,
                        data,
                    },
                    Err(e) => Completion::PageFailed {
                        generation,
                        pos,
                        error: e.to_string(),
                    },
                }
            }
            IoRequest::FetchSequence { hash, file } => {
                match client.sequence(&path_base, &file).await {
                    Ok(sequence) => Completion::SequenceLoaded {
                        hash,
                        sequence: Some(sequence),
                    },
                    Err(NetError::NotFound) => Completion::SequenceLoaded {
                        hash,
                        sequence: None,
                    },
                    Err(e) => {
                        warn!(file = %file, error = %e, "sequence fetch failed");
                        Completion::SequenceLoaded {
                            hash,
                            sequence: None,
                        }
                    }
                }
            }
            IoRequest::PropBatch { batch_id, batch } => {
                let result = match &batch {
                    PropBatch::Create(props) => client.create_props(world_id, props).await,
                    PropBatch::Update(updates) => client.update_props(world_id, updates).await,
                    PropBatch::Delete(ids) => client.delete_props(world_id, ids).await,
                };
                match result {
                    Ok(status) => Completion::BatchDone { batch_id, status },
                    Err(e) => Completion::BatchFailed {
                        batch_id,
                        error: e.to_string(),
                    },
                }
            }
        };
        if tx.send(completion).is_err() {
            return;
        }
    }
}

/// The lazy-load policy: cache first, falling back to the network on a
/// miss or a corrupt entry (which gets deleted); network responses are
/// written back.
async fn fetch_chunk<W: WorldServer>(
    client: &W,
    world_id: u32,
    chunk_side: f32,
    cache: &mut ChunkCache,
    generation: u64,
    pos: ChunkPos,
    hide: bool,
    lazy: bool,
) -> Completion {
    if lazy {
        match cache.get(world_id, pos.cx, pos.cz) {
            Ok(Some(record)) => {
                debug!(%pos, "chunk served from cache");
                return Completion::ChunkLoaded {
                    generation,
                    pos,
                    hide,
                    props: record.props,
                };
            }
            Ok(None) => {}
            Err(e) => {
                warn!(%pos, error = %e, "dropping corrupt cache entry");
                if let Err(e) = cache.delete(world_id, pos.cx, pos.cz) {
                    warn!(%pos, error = %e, "cache delete failed");
                }
            }
        }
    }
    match client.chunk_props(world_id, pos, chunk_side).await {
        Ok(props) => {
            if let Err(e) = cache.put(world_id, pos.cx, pos.cz, &props) {
                warn!(%pos, error = %e, "cache write-back failed");
            }
            Completion::ChunkLoaded {
                generation,
                pos,
                hide,
                props,
            }
        }
        Err(e) => Completion::ChunkFailed {
            generation,
            pos,
            error: e.to_string(),
        },
    }
}
