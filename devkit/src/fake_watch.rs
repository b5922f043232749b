/*!
Fausse montre TCP

Simule le périphérique côté montre pour les tests d'intégration: écoute sur
un port local, journalise chaque ligne reçue (annonce de mode, commandes
haptiques) et rejoue un script de lignes par connexion acceptée.
*/

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Comportement d'une connexion acceptée.
#[derive(Debug, Clone, Default)]
pub struct WatchScript {
    /// Lignes envoyées après réception de l'annonce de mode.
    pub lines: Vec<String>,
    /// Couper la connexion une fois le script envoyé.
    pub close_after: bool,
}

impl WatchScript {
    pub fn send(lines: Vec<String>) -> Self {
        Self {
            lines,
            close_after: false,
        }
    }

    pub fn send_then_close(lines: Vec<String>) -> Self {
        Self {
            lines,
            close_after: true,
        }
    }

    /// Connexion silencieuse qui reste ouverte.
    pub fn idle() -> Self {
        Self::default()
    }
}

#[derive(Default)]
struct WatchState {
    scripts: Mutex<Vec<WatchScript>>,
    received: Mutex<Vec<String>>,
    connections: Mutex<u32>,
}

/// Montre simulée; chaque connexion consomme le prochain script de la liste
/// (ou reste silencieuse quand la liste est épuisée).
pub struct FakeWatch {
    state: Arc<WatchState>,
    addr: String,
}

impl FakeWatch {
    pub async fn start(scripts: Vec<WatchScript>) -> Result<Self> {
        let mut scripts = scripts;
        scripts.reverse(); // pop() consomme dans l'ordre d'origine

        let state = Arc::new(WatchState {
            scripts: Mutex::new(scripts),
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, peer)) = listener.accept().await else {
                    return;
                };
                debug!("[WATCH] connection from {peer}");
                *accept_state.connections.lock() += 1;
                let script = accept_state.scripts.lock().pop().unwrap_or_default();
                tokio::spawn(serve_connection(socket, script, accept_state.clone()));
            }
        });

        Ok(Self { state, addr })
    }

    pub fn addr(&self) -> String {
        self.addr.clone()
    }

    /// Toutes les lignes reçues de l'agent, connexions confondues.
    pub fn received_lines(&self) -> Vec<String> {
        self.state.received.lock().clone()
    }

    pub fn connection_count(&self) -> u32 {
        *self.state.connections.lock()
    }

    /// Attend qu'une ligne contenant `needle` ait été reçue.
    pub async fn wait_for_line(&self, needle: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self
                .state
                .received
                .lock()
                .iter()
                .any(|l| l.contains(needle))
            {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Attend que `n` connexions aient été acceptées.
    pub async fn wait_for_connections(&self, n: u32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.connection_count() >= n {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn serve_connection(socket: TcpStream, script: WatchScript, state: Arc<WatchState>) {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // La première ligne est l'annonce de mode de l'agent.
    match lines.next_line().await {
        Ok(Some(line)) => {
            debug!("[WATCH] received: {line}");
            state.received.lock().push(line);
        }
        _ => return,
    }

    for line in &script.lines {
        if write_half
            .write_all(format!("{line}\n").as_bytes())
            .await
            .is_err()
        {
            return;
        }
    }
    let _ = write_half.flush().await;

    if script.close_after {
        debug!("[WATCH] closing connection after script");
        return; // drop des deux moitiés = fermeture
    }

    // Continue à journaliser ce que l'agent envoie (commandes haptiques).
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[WATCH] received: {line}");
        state.received.lock().push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_watch_replays_script_and_records_lines() {
        let watch = FakeWatch::start(vec![WatchScript::send(vec![
            "MonitoringType:HeartRate,Value:70".to_string(),
        ])])
        .await
        .unwrap();

        let mut stream = TcpStream::connect(watch.addr()).await.unwrap();
        stream.write_all(b"Monitoring:HeartRate\n").await.unwrap();

        let mut reply = String::new();
        let mut reader = BufReader::new(&mut stream);
        tokio::time::timeout(Duration::from_secs(1), reader.read_line(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.trim(), "MonitoringType:HeartRate,Value:70");

        stream.write_all(b"Vibrate:2,3,250,500\n").await.unwrap();
        assert!(watch.wait_for_line("Vibrate:", Duration::from_secs(1)).await);
        assert_eq!(watch.received_lines()[0], "Monitoring:HeartRate");
        assert_eq!(watch.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_close_after_script_drops_the_connection() {
        let watch = FakeWatch::start(vec![
            WatchScript::send_then_close(vec![]),
            WatchScript::idle(),
        ])
        .await
        .unwrap();

        let mut stream = TcpStream::connect(watch.addr()).await.unwrap();
        stream.write_all(b"Monitoring:HeartRate\n").await.unwrap();
        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(1), stream.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0, "first connection should close after its script");

        let mut second = TcpStream::connect(watch.addr()).await.unwrap();
        second.write_all(b"Monitoring:HeartRate\n").await.unwrap();
        assert!(watch.wait_for_connections(2, Duration::from_secs(1)).await);
    }
}
