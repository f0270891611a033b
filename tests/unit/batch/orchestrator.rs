use super::*;
use crate::assemble::sink::InMemoryDocumentSink;

struct SlowSink {
    delay: Duration,
}

impl DocumentSink for SlowSink {
    fn write(&self, _doc: &AssembledDocument) -> MailResult<()> {
        std::thread::sleep(self.delay);
        Ok(())
    }
}

fn doc(name: &str) -> AssembledDocument {
    AssembledDocument {
        name: name.to_owned(),
        mode: DocumentMode::Merged,
        recipient_indices: vec![0],
        bytes: vec![1, 2, 3],
    }
}

#[test]
fn writer_acknowledges_successful_writes() {
    let sink = Arc::new(InMemoryDocumentSink::new());
    let writer = DocumentWriter::spawn(sink.clone(), BatchId(1)).unwrap();
    writer.write(doc("a.pdf"), Duration::from_secs(5)).unwrap();
    writer.close(Duration::from_secs(5));
    assert_eq!(sink.names(), vec!["a.pdf"]);
}

#[test]
fn slow_sink_surfaces_as_write_timeout() {
    let sink = Arc::new(SlowSink {
        delay: Duration::from_millis(300),
    });
    let writer = DocumentWriter::spawn(sink, BatchId(2)).unwrap();
    let err = writer
        .write(doc("slow.pdf"), Duration::from_millis(20))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriteTimeout);
    writer.close(Duration::from_millis(10));
}
