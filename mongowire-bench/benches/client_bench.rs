//! Client round-trip benchmarks against an in-process reply server.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mongowire_client::{Connection, ConnectionConfig, Database};
use mongowire_protocol::{Document, Message, MessageDecoder, Query, ReplyMessage, Request, Selector};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

/// Documents returned per batch; queries start a cursor that spans `BATCHES` batches.
const BATCH: usize = 100;
const BATCHES: i64 = 5;

/// Answers commands with `{ok: 1, n: 0}`, queries and get-mores with batches.
async fn serve(listener: TcpListener) {
    while let Ok((mut socket, _)) = listener.accept().await {
        tokio::spawn(async move {
            let batch: Vec<Document> = (0..BATCH)
                .map(|i| Document::new().with("i", i as i32).unwrap())
                .collect();
            let mut decoder = MessageDecoder::new();
            let mut buf = vec![0u8; 64 * 1024];
            let mut reply_id = 0;
            loop {
                while let Ok(Some(Message::Request { header, request })) =
                    decoder.decode_message()
                {
                    let reply = match request {
                        Request::Query(query) if query.namespace.collection == "$cmd" => {
                            let ok = Document::new().with("ok", 1.0).unwrap().with("n", 0).unwrap();
                            ReplyMessage::new(0, 0, vec![ok])
                        }
                        Request::Query(_) => ReplyMessage::new(1, 0, batch.clone()),
                        Request::GetMore(get_more) => {
                            let next = if get_more.cursor_id + 1 >= BATCHES {
                                0
                            } else {
                                get_more.cursor_id + 1
                            };
                            ReplyMessage::new(next, 0, batch.clone())
                        }
                        _ => continue,
                    };
                    reply_id += 1;
                    let bytes = reply.encode(reply_id, header.request_id).unwrap();
                    if socket.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => decoder.extend(&buf[..n]),
                }
            }
        });
    }
}

fn setup(rt: &Runtime) -> Database {
    rt.block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener));

        let conn = Connection::new(ConnectionConfig::new(addr, "bench"));
        conn.connect().await.unwrap();
        Database::from_connection(Arc::new(conn))
    })
}

fn bench_command_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let db = setup(&rt);

    let mut group = c.benchmark_group("client_command");
    group.throughput(Throughput::Elements(1));
    group.bench_function("count", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(db.count("items", Selector::new()).await.unwrap()) });
    });
    group.finish();
}

fn bench_cursor_drain(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let db = setup(&rt);
    let coll = db.collection("items").unwrap();

    let mut group = c.benchmark_group("client_cursor_drain");
    for batch_size in [0, 50] {
        group.throughput(Throughput::Elements(BATCH as u64 * BATCHES as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                b.to_async(&rt).iter(|| async {
                    let mut cursor = coll.find(Query::all().batch_size(batch_size)).await.unwrap();
                    let docs = cursor.collect_all().await.unwrap();
                    cursor.close().await.unwrap();
                    black_box(docs)
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_command_latency, bench_cursor_drain);
criterion_main!(benches);
