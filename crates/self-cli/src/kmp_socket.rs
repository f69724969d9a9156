//! `Kmp` implementation backed by a local Unix-domain socket.
//!
//! `kread`/`kwrite` are the one genuine external dependency the pipeline
//! has no business implementing itself (§4.1: "obtained however the host
//! environment obtains it"). This binary assumes that primitive is already
//! running as a separate privileged helper process and exposes it over a
//! small framed request/response protocol on a Unix socket, so the pipeline
//! proper never has to know how kernel read/write was actually achieved.
//!
//! Wire format, one exchange per call:
//! `op: u8 (0 = read, 1 = write) | kva: u64 LE | len: u32 LE | [data if write]`
//! response: `status: u8 (0 = ok) | [data if read and ok]`.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::rc::Rc;

use self_kernel::KernelError;

const OP_READ: u8 = 0;
const OP_WRITE: u8 = 1;

/// A [`self_kernel::Kmp`] that forwards every `kread`/`kwrite` to a helper
/// process over a Unix socket.
///
/// Holds the connection behind `Rc<RefCell<_>>` rather than requiring `&mut
/// self`, so cloning shares the one underlying connection: `self-kernel`'s
/// decrypt service clones its `Kmp` to give the mailbox transport and its
/// own scratch-region accessor independent handles (`Kmp` carries no
/// `Send`/`Sync` bound, so `Rc` is the right shared-ownership type here,
/// not `Arc`).
pub struct SocketKmp {
    stream: Rc<RefCell<UnixStream>>,
}

impl Clone for SocketKmp {
    fn clone(&self) -> Self {
        Self { stream: Rc::clone(&self.stream) }
    }
}

impl SocketKmp {
    /// Connects to the kernel-access helper listening on `socket_path`.
    pub fn connect(socket_path: &Path) -> Result<Self, KernelError> {
        let stream = UnixStream::connect(socket_path).map_err(|_| KernelError::AccessRefused { kva: 0 })?;
        Ok(Self { stream: Rc::new(RefCell::new(stream)) })
    }

    fn exchange(&self, op: u8, kva: u64, len: u32, payload: &[u8]) -> Result<Vec<u8>, KernelError> {
        let mut stream = self.stream.borrow_mut();
        let mut frame = Vec::with_capacity(13 + payload.len());
        frame.push(op);
        frame.extend_from_slice(&kva.to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(payload);
        stream.write_all(&frame).map_err(|_| KernelError::AccessRefused { kva })?;

        let mut status = [0u8; 1];
        stream.read_exact(&mut status).map_err(|_| KernelError::AccessRefused { kva })?;
        if status[0] != 0 {
            return Err(KernelError::AccessRefused { kva });
        }

        if op == OP_READ {
            let mut data = vec![0u8; len as usize];
            stream.read_exact(&mut data).map_err(|_| KernelError::AccessRefused { kva })?;
            Ok(data)
        } else {
            Ok(Vec::new())
        }
    }
}

impl self_kernel::Kmp for SocketKmp {
    fn kread(&self, kva: u64, dst: &mut [u8]) -> Result<(), KernelError> {
        let data = self.exchange(OP_READ, kva, dst.len() as u32, &[])?;
        dst.copy_from_slice(&data);
        Ok(())
    }

    fn kwrite(&self, kva: u64, src: &[u8]) -> Result<(), KernelError> {
        self.exchange(OP_WRITE, kva, src.len() as u32, src).map(|_| ())
    }
}
