use rfbus::framing::pad_to_sector;
use rfbus::opcodes::SECTOR_SIZE;
use rfbus::processor::{OpcodeProcessor, ProcessorConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time;
use tracing::{error, info, warn};

const TCP_PORT: u16 = 4950;
const TICK_INTERVAL_MS: u64 = 1;
const RESPONSE_BROADCAST_BUFFER_SIZE: usize = 256;
const STATS_LOG_INTERVAL_TICKS: u64 = 1000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    println!("📡 RF Instrument Bus Processor");
    println!("==============================");

    let processor = Arc::new(Mutex::new(OpcodeProcessor::new(ProcessorConfig::default())));

    // Create broadcast channel for outbound responses
    let (response_tx, _) = broadcast::channel(RESPONSE_BROADCAST_BUFFER_SIZE);

    // Start TCP server
    let tcp_processor = Arc::clone(&processor);
    let tcp_response_tx = response_tx.clone();
    let tcp_server = tokio::spawn(async move {
        if let Err(e) = start_tcp_server(tcp_processor, tcp_response_tx).await {
            error!("TCP server error: {}", e);
        }
    });

    // Main instrument loop - system clock tick at 1 kHz
    let tick_processor = Arc::clone(&processor);
    let tick_task = tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_millis(TICK_INTERVAL_MS));
        let mut tick_count: u64 = 0;

        loop {
            interval.tick().await;

            let mut proc = tick_processor.lock().await;
            proc.tick();

            // Drain every response that became ready this tick. Each one
            // ships at the head of its own sector-padded block.
            while let Some(bytes) = proc.take_response() {
                if response_tx.receiver_count() > 0 {
                    let mut block = bytes.to_vec();
                    pad_to_sector(&mut block);
                    if let Err(e) = response_tx.send(block) {
                        warn!("Failed to broadcast response: {}", e);
                    }
                }
            }

            tick_count += 1;
            if tick_count % STATS_LOG_INTERVAL_TICKS == 0 {
                match serde_json::to_string(&proc.stats()) {
                    Ok(json) => info!("📊 STATS: {}", json),
                    Err(e) => warn!("Failed to serialize stats: {}", e),
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;

    tick_task.abort();
    tcp_server.abort();
    println!("📡 RF Instrument Bus Processor stopped");

    Ok(())
}

async fn start_tcp_server(
    processor: Arc<Mutex<OpcodeProcessor>>,
    response_tx: broadcast::Sender<Vec<u8>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", TCP_PORT)).await?;
    info!("🌐 TCP server listening on port {}", TCP_PORT);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("🔗 New host connected: {}", addr);
                let client_processor = Arc::clone(&processor);
                let client_response_rx = response_tx.subscribe();

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_processor, client_response_rx).await
                    {
                        warn!("Host {} error: {}", addr, e);
                    }
                    info!("🔌 Host {} disconnected", addr);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    processor: Arc<Mutex<OpcodeProcessor>>,
    mut response_rx: broadcast::Receiver<Vec<u8>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (mut reader, mut writer) = stream.into_split();

    // Spawn response streaming task
    let response_task = tokio::spawn(async move {
        while let Ok(bytes) = response_rx.recv().await {
            if let Err(e) = writer.write_all(&bytes).await {
                warn!("Failed to send response: {}", e);
                break;
            }
        }
    });

    // Raw sector stream from the host; the frame decoder handles blocks
    // of any size, including frames straddling sector boundaries
    let mut buffer = vec![0u8; SECTOR_SIZE];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break, // Host disconnected
            Ok(n) => {
                let mut proc = processor.lock().await;
                proc.feed(&buffer[..n]);
            }
            Err(e) => {
                error!("Error reading from host: {}", e);
                break;
            }
        }
    }

    response_task.abort();
    Ok(())
}
