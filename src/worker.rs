//! Single background worker for the build/extract pipeline.
//!
//! The pipeline runs on one thread, separate from whatever interactive thread
//! submits work. Jobs arrive over an mpsc channel and answer on per-job reply
//! channels; serializing them through one worker keeps index builds and bulk
//! extractions from interleaving their tool invocations.

use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

use crate::config::Context;
use crate::error::{Error, Result};
use crate::extract::{Extractor, Source};
use crate::index::{IndexBuilder, IndexReport};
use crate::sector::SectorDecode;

pub enum Job {
    BuildIndex {
        reply: Sender<Result<IndexReport>>,
    },
    ExtractBulk {
        paths: Vec<String>,
        reply: Sender<Result<Vec<Result<Vec<u8>>>>>,
    },
    DecodeSectors {
        paths: Vec<String>,
        source: Source,
        reply: Sender<Result<Vec<Result<SectorDecode>>>>,
    },
}

pub struct PipelineWorker {
    tx: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl PipelineWorker {
    /// Take ownership of the context and process jobs until shutdown.
    pub fn spawn(ctx: Context) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let handle = std::thread::spawn(move || {
            let extractor = Extractor::new(
                &ctx.cache,
                &ctx.tool,
                &ctx.game_dir,
                ctx.scratch_root.clone(),
            );

            while let Ok(job) = rx.recv() {
                match job {
                    Job::BuildIndex { reply } => {
                        let builder = IndexBuilder::new(&ctx.cache, &ctx.tool, &ctx.game_dir);
                        let _ = reply.send(builder.build());
                    }
                    Job::ExtractBulk { paths, reply } => {
                        let _ = reply.send(extractor.extract_bulk(&paths));
                    }
                    Job::DecodeSectors { paths, source, reply } => {
                        let _ = reply.send(extractor.sectors_bulk(&paths, source));
                    }
                }
            }
        });

        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    pub fn submit(&self, job: Job) -> Result<()> {
        let tx = self.tx.as_ref().ok_or_else(worker_gone)?;
        tx.send(job).map_err(|_| worker_gone())
    }

    /// Build the index on the worker and wait for the result.
    pub fn build_index(&self) -> Result<IndexReport> {
        let (reply, rx) = mpsc::channel();
        self.submit(Job::BuildIndex { reply })?;
        rx.recv().map_err(|_| worker_gone())?
    }

    /// Bulk-extract on the worker and wait for the result.
    pub fn extract_bulk(&self, paths: Vec<String>) -> Result<Vec<Result<Vec<u8>>>> {
        let (reply, rx) = mpsc::channel();
        self.submit(Job::ExtractBulk { paths, reply })?;
        rx.recv().map_err(|_| worker_gone())?
    }

    /// Decode sectors on the worker and wait for the result.
    pub fn decode_sectors(
        &self,
        paths: Vec<String>,
        source: Source,
    ) -> Result<Vec<Result<SectorDecode>>> {
        let (reply, rx) = mpsc::channel();
        self.submit(Job::DecodeSectors { paths, source, reply })?;
        rx.recv().map_err(|_| worker_gone())?
    }

    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PipelineWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_gone() -> Error {
    Error::Io(std::io::Error::other("pipeline worker stopped"))
}
