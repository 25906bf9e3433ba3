//! Handles das tasks de longa duração (renovação de lock, workers de fila).
//!
//! O sinal de parada é um canal broadcast: fechar o sender acorda todos os
//! receivers. Dropar o handle fecha o canal e as tasks encerram sozinhas.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub(crate) fn shutdown_channel() -> (broadcast::Sender<()>, broadcast::Receiver<()>) {
    broadcast::channel(1)
}

/// true quando o sinal de parada chegou ou o sender foi dropado.
pub(crate) fn stop_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    !matches!(
        shutdown.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    )
}

/// Dorme `backoff`, acordando antes se a parada for pedida. true = parar.
pub(crate) async fn idle(shutdown: &mut broadcast::Receiver<()>, backoff: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(backoff) => false,
        _ = shutdown.recv() => true,
    }
}

/// Handle do loop de renovação de um [`Lock`](crate::Lock).
#[derive(Debug)]
pub struct RefreshHandle {
    shutdown: Option<broadcast::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RefreshHandle {
    pub(crate) fn new(shutdown: broadcast::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    /// Para o loop e espera ele terminar.
    pub async fn stop(mut self) {
        drop(self.shutdown.take());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// O loop terminou (lock perdido, falha de renovação ou parada).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

/// Handle de um grupo de workers de [`Queue`](crate::Queue).
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Option<broadcast::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(shutdown: broadcast::Sender<()>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self {
            shutdown: Some(shutdown),
            tasks,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Sinaliza todos os workers e espera cada um terminar o item atual.
    pub async fn stop(mut self) {
        drop(self.shutdown.take());
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}
