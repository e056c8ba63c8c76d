// Host side of the SCIF. Two single-producer single-consumer byte rings
// connect the emulation thread to a TCP bridge thread; the bridge raises
// `something_pending` whenever it has touched either ring and the CPU
// rescans the FIFO state at the next instruction boundary.

use log::{info, warn};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const RING_LEN: usize = 1024;

/// Lock-free SPSC byte ring. Exactly one thread produces and exactly one
/// consumes; head and tail only ever advance on their owning side.
pub struct TextRing {
    buf: Vec<AtomicU8>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl TextRing {
    pub fn new() -> Arc<TextRing> {
        let mut buf = Vec::with_capacity(RING_LEN);
        for _ in 0..RING_LEN {
            buf.push(AtomicU8::new(0));
        }
        Arc::new(TextRing { buf, head: AtomicUsize::new(0), tail: AtomicUsize::new(0) })
    }
    pub fn produce(&self, byte: u8) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= RING_LEN {
            return false;
        }
        self.buf[head % RING_LEN].store(byte, Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }
    pub fn consume(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let byte = self.buf[tail % RING_LEN].load(Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(byte)
    }
    pub fn len(&self) -> usize {
        self.head
            .load(Ordering::Acquire)
            .wrapping_sub(self.tail.load(Ordering::Acquire))
    }
}

pub struct SerialServer {
    handle: Option<thread::JoinHandle<()>>,
}

impl SerialServer {
    /// Listen on the given port and bridge the first client onto the SCIF
    /// rings. `txq` is consumed here and sent to the client, `rxq` is fed
    /// from the client.
    pub fn launch(
        port: u16,
        txq: Arc<TextRing>,
        rxq: Arc<TextRing>,
        something_pending: Arc<AtomicBool>,
        kill: Arc<AtomicBool>,
    ) -> std::io::Result<SerialServer> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        info!("serial bridge listening on port {}", port);
        let handle = thread::spawn(move || {
            listener.set_nonblocking(true).ok();
            let stream = loop {
                if kill.load(Ordering::Relaxed) {
                    return;
                }
                match listener.accept() {
                    Ok((stream, peer)) => {
                        info!("serial bridge client connected from {}", peer);
                        break stream;
                    }
                    Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(err) => {
                        warn!("serial bridge accept failed: {}", err);
                        return;
                    }
                }
            };
            bridge(stream, &txq, &rxq, &something_pending, &kill);
        });
        Ok(SerialServer { handle: Some(handle) })
    }
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

fn bridge(
    mut stream: TcpStream,
    txq: &TextRing,
    rxq: &TextRing,
    something_pending: &AtomicBool,
    kill: &AtomicBool,
) {
    stream.set_nonblocking(true).ok();
    let mut buf = [0u8; 128];
    while !kill.load(Ordering::Relaxed) {
        let mut moved = false;
        match stream.read(&mut buf) {
            Ok(0) => {
                info!("serial bridge client disconnected");
                return;
            }
            Ok(n) => {
                for &byte in &buf[..n] {
                    if !rxq.produce(byte) {
                        warn!("serial bridge rx ring overrun, dropping input");
                        break;
                    }
                }
                moved = true;
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => {
                warn!("serial bridge read failed: {}", err);
                return;
            }
        }
        let mut out = Vec::new();
        while let Some(byte) = txq.consume() {
            out.push(byte);
            if out.len() >= buf.len() {
                break;
            }
        }
        if !out.is_empty() {
            moved = true;
            if let Err(err) = stream.write_all(&out) {
                warn!("serial bridge write failed: {}", err);
                return;
            }
        }
        if moved {
            something_pending.store(true, Ordering::Release);
        } else {
            thread::sleep(Duration::from_millis(2));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_fifo() {
        let ring = TextRing::new();
        for b in 0..200u8 {
            assert!(ring.produce(b));
        }
        for b in 0..200u8 {
            assert_eq!(ring.consume(), Some(b));
        }
        assert_eq!(ring.consume(), None);
    }

    #[test]
    fn ring_rejects_overrun() {
        let ring = TextRing::new();
        for b in 0..RING_LEN {
            assert!(ring.produce(b as u8));
        }
        assert!(!ring.produce(0xaa));
        assert_eq!(ring.len(), RING_LEN);
    }

    #[test]
    fn ring_survives_wraparound() {
        let ring = TextRing::new();
        for round in 0..5u32 {
            for j in 0..700u32 {
                assert!(ring.produce((round + j) as u8));
            }
            for j in 0..700u32 {
                assert_eq!(ring.consume(), Some((round + j) as u8));
            }
        }
    }
}
