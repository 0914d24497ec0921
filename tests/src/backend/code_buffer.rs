use std::sync::atomic::Ordering;

use tcg_backend::code_buffer::CodeBuffer;

#[test]
fn test_emit_and_read() {
    let mut buf = CodeBuffer::new(4096).unwrap();
    buf.emit_u64(0xDEAD_BEEF_0000_0001);
    buf.emit_u64(u64::from_le_bytes([1, 2, 3, 4, 5, 6, 7, 8]));
    assert_eq!(buf.offset(), 16);
    let region = buf.region();
    // SAFETY: both words were emitted above and buf is alive.
    unsafe {
        assert_eq!(region.read_u64(0), 0xDEAD_BEEF_0000_0001);
        assert_eq!(region.read_u64(8), u64::from_le_bytes([1, 2, 3, 4, 5, 6, 7, 8]));
    }
}

#[test]
fn test_size_rounds_to_pages() {
    let buf = CodeBuffer::new(100).unwrap();
    assert!(buf.capacity() >= 4096);
    assert_eq!(buf.capacity() % 4096, 0);
    assert_eq!(buf.remaining(), buf.capacity());
    assert_eq!(buf.region().len(), buf.capacity());
}

#[test]
fn test_set_offset_rewinds() {
    let mut buf = CodeBuffer::new(4096).unwrap();
    buf.emit_u64(1);
    buf.emit_u64(2);
    buf.set_offset(0);
    assert_eq!(buf.offset(), 0);
    buf.emit_u64(3);
    // SAFETY: word 0 was rewritten above.
    assert_eq!(unsafe { buf.region().read_u64(0) }, 3);
}

#[test]
#[should_panic(expected = "code buffer overflow")]
fn test_overflow_panics() {
    let mut buf = CodeBuffer::new(4096).unwrap();
    while buf.remaining() > 0 {
        buf.emit_u64(0);
    }
    buf.emit_u64(0);
}

#[test]
fn test_link_word_atomic() {
    let mut buf = CodeBuffer::new(4096).unwrap();
    buf.emit_u64(0);
    buf.emit_u64(0);
    let region = buf.region();
    // SAFETY: offset 8 is an emitted, aligned word only used atomically here.
    let word = unsafe { region.link_word(8) };
    word.store(0x1234, Ordering::Release);
    assert_eq!(word.load(Ordering::Acquire), 0x1234);
    // SAFETY: as above.
    assert_eq!(unsafe { region.read_u64(8) }, 0x1234);
}

#[test]
#[should_panic(expected = "offset past end of code buffer")]
fn test_set_offset_checked() {
    let mut buf = CodeBuffer::new(4096).unwrap();
    let end = buf.capacity();
    buf.set_offset(end + 8);
}

#[test]
#[should_panic(expected = "link word must be 8-byte aligned")]
fn test_link_word_alignment_checked() {
    let buf = CodeBuffer::new(4096).unwrap();
    // SAFETY: the assertion fires before any access.
    let _ = unsafe { buf.region().link_word(4) };
}
