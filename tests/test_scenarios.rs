//! End-to-end runs through an in-process cluster

mod common;

use pretty_assertions::assert_eq;

use common::{config, finish, within, work_until_shutdown};
use xlb::{Cluster, Code, CreateSpec, DataKind, DataValue, Event};

const NOTIFY: i32 = 0;

#[tokio::test]
async fn test_close_notifies_every_subscriber() {
    within(async {
        let mut cluster = Cluster::launch(config(3, 1, &[1])).unwrap();
        let mut clients = cluster.clients();

        let id = clients[0].create_integer(1).await.unwrap();
        assert_eq!(id, 1);

        let a = clients[1].subscribe(1).await.unwrap();
        let b = clients[2].subscribe(1).await.unwrap();
        assert!(!a.is_satisfied());
        assert!(!b.is_satisfied());

        clients[0].store(1, DataValue::Integer(42), 1).await.unwrap();

        for (client, sub) in clients[1..].iter_mut().zip([a, b]) {
            let note = client.next_notification().await.unwrap();
            assert_eq!(note.id, 1);
            assert_eq!(note.token, sub.token);
            assert_eq!(note.event, Event::Closed);
        }

        let late = clients[0].subscribe(1).await.unwrap();
        assert!(late.is_satisfied());
        assert_eq!(clients[0].retrieve(1).await.unwrap(), DataValue::Integer(42));

        let stats = finish(cluster, clients, NOTIFY).await;
        assert_eq!(stats[0].notifications_sent, 2);
    })
    .await;
}

#[tokio::test]
async fn test_insert_atomic_has_one_winner() {
    within(async {
        let mut cluster = Cluster::launch(config(2, 1, &[1])).unwrap();
        let mut clients = cluster.clients();
        clients[0]
            .create_container(2, DataKind::String)
            .await
            .unwrap();

        let mut y = clients.pop().unwrap();
        let mut x = clients.pop().unwrap();
        let (won_x, won_y) = tokio::join!(x.insert_atomic(2, "k"), y.insert_atomic(2, "k"));
        let (won_x, won_y) = (won_x.unwrap(), won_y.unwrap());
        assert!(won_x ^ won_y);

        let (winner, other) = if won_x { (&mut x, &mut y) } else { (&mut y, &mut x) };
        assert_eq!(other.lookup(2, "k").await.unwrap(), None);
        winner.insert(2, "k", b"value".to_vec(), 1).await.unwrap();
        assert_eq!(other.lookup(2, "k").await.unwrap(), Some(b"value".to_vec()));
        assert_eq!(other.container_size(2).await.unwrap(), 1);

        finish(cluster, vec![x, y], NOTIFY).await;
    })
    .await;
}

#[tokio::test]
async fn test_priority_then_arrival_order() {
    within(async {
        let mut cluster = Cluster::launch(config(2, 1, &[5])).unwrap();
        let mut clients = cluster.clients();

        for (payload, priority) in [(b"first", 1), (b"urgnt", 9), (b"third", 1)] {
            clients[0]
                .put(payload.to_vec(), 5, priority, None)
                .await
                .unwrap();
        }

        let mut order = Vec::new();
        for i in [1, 0, 1] {
            order.push(clients[i].get(5).await.unwrap().payload);
        }
        assert_eq!(
            order,
            vec![b"urgnt".to_vec(), b"first".to_vec(), b"third".to_vec()]
        );

        finish(cluster, clients, 5).await;
    })
    .await;
}

#[tokio::test]
async fn test_quiescence_shuts_down_every_server() {
    within(async {
        let mut cluster = Cluster::launch(config(4, 2, &[1])).unwrap();
        let clients = cluster.clients();

        let workers: Vec<_> = clients
            .into_iter()
            .map(|mut c| {
                tokio::spawn(async move {
                    let err = c.get(1).await.unwrap_err();
                    assert_eq!(err.code(), Code::Shutdown);
                    // still refused after the fact
                    let err = c.get(1).await.unwrap_err();
                    assert_eq!(err.code(), Code::Shutdown);
                    let err = c.unique().await.unwrap_err();
                    assert!(err.is_shutdown());
                    c.finalize().await.unwrap();
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }

        let stats = cluster.join().await.unwrap();
        assert_eq!(stats.len(), 2);
        assert!(stats[0].vote_rounds >= 2);
        assert!(stats.iter().all(|s| s.finished_at.is_some()));
    })
    .await;
}

#[tokio::test]
async fn test_work_spreads_to_starving_server() {
    within(async {
        let mut cluster = Cluster::launch(config(2, 2, &[1])).unwrap();
        let mut clients = cluster.clients();
        let producer_home = clients[0].home_server();
        assert_ne!(producer_home, clients[1].home_server());

        for i in 0..8u8 {
            clients[0].put(vec![i], 1, 0, None).await.unwrap();
        }
        let thief = clients.pop().unwrap();
        let producer = clients.pop().unwrap();
        let thief = tokio::spawn(work_until_shutdown(thief, 1));
        let producer = tokio::spawn(work_until_shutdown(producer, 1));

        let mut payloads: Vec<u8> = thief
            .await
            .unwrap()
            .unwrap()
            .into_iter()
            .chain(producer.await.unwrap().unwrap())
            .map(|u| u.payload[0])
            .collect();
        payloads.sort();
        assert_eq!(payloads, (0..8).collect::<Vec<_>>());

        let stats = cluster.join().await.unwrap();
        let stolen: u64 = stats.iter().map(|s| s.stolen_in).sum();
        let given: u64 = stats.iter().map(|s| s.stolen_out).sum();
        assert_eq!(stolen, given);
    })
    .await;
}

#[tokio::test]
async fn test_targeted_put_reaches_remote_worker() {
    within(async {
        let mut cluster = Cluster::launch(config(2, 2, &[1])).unwrap();
        let mut clients = cluster.clients();

        clients[0]
            .put(b"for one".to_vec(), 1, 0, Some(1))
            .await
            .unwrap();

        let got = clients[1].get(1).await.unwrap();
        assert_eq!(got.payload, b"for one");
        assert_eq!(got.target, Some(1));
        assert_eq!(got.answer, 0);

        // routed straight to the target's home server
        let stats = finish(cluster, clients, 1).await;
        assert_eq!(stats[1].puts, 1);
        assert_eq!(stats[0].puts, 0);
    })
    .await;
}

#[tokio::test]
async fn test_reference_crosses_servers() {
    within(async {
        let mut cluster = Cluster::launch(config(2, 2, &[1])).unwrap();
        let mut clients = cluster.clients();
        // ids 2 and 3 hash to different servers
        clients[0]
            .create_container(2, DataKind::String)
            .await
            .unwrap();
        clients[0].create_integer(3).await.unwrap();

        let on_target = clients[1].subscribe(3).await.unwrap();
        let on_member = clients[1]
            .container_reference(2, "answer", Some(3))
            .await
            .unwrap();
        assert!(!on_member.is_satisfied());

        clients[0]
            .insert(2, "answer", 7i64.to_le_bytes().to_vec(), 1)
            .await
            .unwrap();

        let mut tokens = Vec::new();
        for _ in 0..2 {
            let note = clients[1].next_notification().await.unwrap();
            tokens.push(note.token);
            if note.token == on_member.token {
                assert_eq!(
                    note.event,
                    Event::Inserted {
                        member: 7i64.to_le_bytes().to_vec()
                    }
                );
            } else {
                assert_eq!(note.event, Event::Closed);
            }
        }
        tokens.sort();
        let mut expected = vec![on_target.token, on_member.token];
        expected.sort();
        assert_eq!(tokens, expected);
        assert_eq!(clients[1].retrieve(3).await.unwrap(), DataValue::Integer(7));

        finish(cluster, clients, NOTIFY).await;
    })
    .await;
}

#[tokio::test]
async fn test_unique_ids_follow_home_shard() {
    within(async {
        let mut cluster = Cluster::launch(config(3, 3, &[1])).unwrap();
        let mut clients = cluster.clients();

        let mut seen = std::collections::HashSet::new();
        for client in clients.iter_mut() {
            let layout = *client.layout();
            for _ in 0..20 {
                let id = client.unique().await.unwrap();
                assert!(id > 0);
                assert_eq!(layout.owner(id), client.home_server());
                assert!(seen.insert(id), "id {} issued twice", id);
            }
        }

        finish(cluster, clients, 1).await;
    })
    .await;
}

#[tokio::test]
async fn test_explicit_shutdown_ignores_open_data() {
    within(async {
        let mut cluster = Cluster::launch(config(2, 2, &[1])).unwrap();
        let mut clients = cluster.clients();

        let id = clients[1].create(CreateSpec::new(0, DataKind::Blob)).await.unwrap();
        clients[1].subscribe(id).await.unwrap();
        let home = clients[1].home_server();
        assert!(!clients[1].server_idle(home).await.unwrap());

        clients[1].server_shutdown().await.unwrap();

        let stats = finish(cluster, clients, 1).await;
        assert_eq!(
            stats.iter().map(|s| s.subscriptions_invalidated).sum::<u64>(),
            1
        );
    })
    .await;
}

#[tokio::test]
async fn test_departed_server_reports_shutdown() {
    within(async {
        let mut cluster = Cluster::launch(config(2, 2, &[1])).unwrap();
        let mut clients = cluster.clients();
        let mut late = clients.pop().unwrap();
        let mut early = clients.pop().unwrap();
        assert_ne!(early.home_server(), late.home_server());

        early.server_shutdown().await.unwrap();
        assert_eq!(early.get(1).await.unwrap_err().code(), Code::Shutdown);
        let gone = early.home_server();
        // its only worker finalized, so this server leaves the run
        early.finalize().await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // id 2 lives on the server that already left
        assert_eq!(late.layout().owner(2), gone);
        let err = late.exists(2).await.unwrap_err();
        assert_eq!(err.code(), Code::Shutdown);
        assert!(err.is_shutdown());

        assert_eq!(late.get(1).await.unwrap_err().code(), Code::Shutdown);
        late.finalize().await.unwrap();
        let stats = cluster.join().await.unwrap();
        assert!(stats.iter().all(|s| s.finished_at.is_some()));
    })
    .await;
}

#[tokio::test]
async fn test_abort_stops_the_run() {
    within(async {
        let mut cluster = Cluster::launch(config(2, 1, &[1])).unwrap();
        let mut clients = cluster.clients();
        let mut waiting = clients.pop().unwrap();
        let aborting = clients.pop().unwrap();

        let waiter = tokio::spawn(async move { waiting.get(1).await });
        tokio::task::yield_now().await;
        let err = aborting.abort(3).await.unwrap_err();
        assert_eq!(err.code(), Code::Error);

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.code(), Code::Error);

        let err = cluster.join().await.unwrap_err();
        assert_eq!(err.category(), "aborted");
    })
    .await;
}
