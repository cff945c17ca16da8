#[macro_use]
extern crate afl;
use peerseal::wire::Frame;

fn main() {
    fuzz!(|data: &[u8]| {
        if let Ok(frame) = Frame::from_bytes(data) {
            let _ = frame.to_bytes();
        }
    });
}
