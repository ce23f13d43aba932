//! End-to-end convergence scenarios.
//!
//! These tests wire [`ClientSync`] machines to a [`DocumentSession`] through
//! in-memory FIFO inboxes, mirroring the server's ack/update routing without
//! sockets, so interleavings can be scripted deterministically.

use std::collections::VecDeque;

use tandem::client::{ClientSync, EditorDelta, SyncState};
use tandem::operation::TextOperation;
use tandem::protocol::{ClientMessage, ServerMessage};
use tandem::session::DocumentSession;
use tandem::storage::DocumentRecord;

/// The server side of the harness: one authoritative session plus a FIFO
/// inbox per client. Acks go to the originator only, updates to everyone
/// else, in serialisation order.
struct Hub {
    session: DocumentSession,
    inboxes: Vec<VecDeque<ServerMessage>>,
}

impl Hub {
    fn new(content: &str, client_count: usize) -> (Self, Vec<ClientSync>) {
        let session = DocumentSession::from_record(
            "pad",
            DocumentRecord {
                content: content.to_string(),
                revision: 0,
                history: Vec::new(),
            },
        );
        let clients = (0..client_count)
            .map(|_| {
                let mut client = ClientSync::new();
                client.handle_initial_state(content.to_string(), 0);
                client
            })
            .collect();
        let inboxes = (0..client_count).map(|_| VecDeque::new()).collect();
        (Self { session, inboxes }, clients)
    }

    /// Process one client message the way the server would.
    fn receive(&mut self, origin: usize, msg: ClientMessage) {
        match msg {
            ClientMessage::Push { revision, op } => match self.session.apply_push(op, revision) {
                Ok(outcome) => {
                    self.inboxes[origin].push_back(ServerMessage::Ack {
                        revision: outcome.revision,
                    });
                    for (idx, inbox) in self.inboxes.iter_mut().enumerate() {
                        if idx != origin {
                            inbox.push_back(ServerMessage::Update {
                                revision: outcome.revision,
                                op: outcome.op.clone(),
                            });
                        }
                    }
                }
                Err(e) => {
                    self.inboxes[origin].push_back(ServerMessage::Error {
                        message: e.to_string(),
                    });
                }
            },
            ClientMessage::Pull { revision } => {
                let reply = self.session.apply_pull(revision);
                self.inboxes[origin].push_back(ServerMessage::History {
                    start_revision: reply.start_revision,
                    ops: reply.ops,
                    current_revision: reply.current_revision,
                    current_doc_state: reply.current_doc_state,
                });
            }
        }
    }

    /// Trigger the client's push tick and route the result.
    fn push_from(&mut self, origin: usize, client: &mut ClientSync) {
        if let Some(msg) = client.take_push() {
            self.receive(origin, msg);
        }
    }

    /// Deliver queued messages until every inbox is drained and no client
    /// has anything left to say.
    fn settle(&mut self, clients: &mut [ClientSync]) {
        loop {
            let mut progressed = false;
            for idx in 0..clients.len() {
                while let Some(msg) = self.inboxes[idx].pop_front() {
                    progressed = true;
                    if let Some(reply) = clients[idx].handle_message(msg) {
                        self.receive(idx, reply);
                    }
                }
                if let Some(push) = clients[idx].take_push() {
                    progressed = true;
                    self.receive(idx, push);
                }
            }
            if !progressed {
                break;
            }
        }
    }
}

fn edit(position: usize, deleted: usize, inserted: &str) -> EditorDelta {
    EditorDelta {
        position,
        deleted,
        inserted: inserted.to_string(),
    }
}

#[test]
fn disjoint_concurrent_inserts_converge() {
    let (mut hub, mut clients) = Hub::new("abcdef", 2);

    clients[0].apply_edit(&edit(1, 0, "X")).unwrap();
    clients[1].apply_edit(&edit(4, 0, "Y")).unwrap();

    // Both pushes reach the server before either client hears back.
    hub.push_from(0, &mut clients[0]);
    hub.push_from(1, &mut clients[1]);
    hub.settle(&mut clients);

    assert_eq!(hub.session.content(), "aXbcdYef");
    assert_eq!(hub.session.revision(), 2);
    assert_eq!(clients[0].content(), "aXbcdYef");
    assert_eq!(clients[1].content(), "aXbcdYef");
    assert_eq!(clients[0].state(), SyncState::Synchronized);
    assert_eq!(clients[1].state(), SyncState::Synchronized);
}

#[test]
fn overlapping_concurrent_deletes_converge() {
    let (mut hub, mut clients) = Hub::new("abcdef", 2);

    clients[0].apply_edit(&edit(1, 3, "")).unwrap();
    assert_eq!(clients[0].content(), "aef");
    clients[1].apply_edit(&edit(2, 3, "")).unwrap();
    assert_eq!(clients[1].content(), "abf");

    hub.push_from(0, &mut clients[0]);
    hub.push_from(1, &mut clients[1]);
    hub.settle(&mut clients);

    assert_eq!(hub.session.content(), "af");
    assert_eq!(hub.session.revision(), 2);
    assert_eq!(clients[0].content(), "af");
    assert_eq!(clients[1].content(), "af");
}

#[test]
fn update_during_outstanding_push_and_buffered_edit() {
    let (mut hub, mut clients) = Hub::new("0123456789", 2);

    // Client 1's insertion is serialised first.
    clients[1].apply_edit(&edit(5, 0, "M")).unwrap();
    hub.push_from(1, &mut clients[1]);

    // Client 0 pushes "H", then keeps typing while the ack is in flight.
    clients[0].apply_edit(&edit(0, 0, "H")).unwrap();
    hub.push_from(0, &mut clients[0]);
    clients[0].apply_edit(&edit(11, 0, "!")).unwrap();
    assert_eq!(clients[0].state(), SyncState::AwaitingPush);

    hub.settle(&mut clients);

    assert_eq!(hub.session.content(), "H01234M56789!");
    assert_eq!(clients[0].content(), "H01234M56789!");
    assert_eq!(clients[1].content(), "H01234M56789!");
}

#[test]
fn lost_update_triggers_pull_and_replay() {
    let (mut hub, mut clients) = Hub::new("base", 2);

    // Client 0 drives the document to revision 5, acked step by step.
    for i in 0..5u32 {
        let len = clients[0].content().chars().count();
        clients[0]
            .apply_edit(&edit(len, 0, &i.to_string()))
            .unwrap();
        hub.push_from(0, &mut clients[0]);
        let ack = hub.inboxes[0].pop_front().unwrap();
        assert!(clients[0].handle_message(ack).is_none());
    }
    assert_eq!(hub.session.revision(), 5);
    assert_eq!(hub.session.content(), "base01234");

    // Client 1 sees revisions 1 to 3, loses 4, then receives 5.
    for _ in 0..3 {
        let update = hub.inboxes[1].pop_front().unwrap();
        assert!(clients[1].handle_message(update).is_none());
    }
    assert_eq!(clients[1].server_revision(), 3);
    let _lost = hub.inboxes[1].pop_front().unwrap();

    let out_of_order = hub.inboxes[1].pop_front().unwrap();
    let reply = clients[1].handle_message(out_of_order);
    assert_eq!(reply, Some(ClientMessage::Pull { revision: 3 }));
    assert_eq!(clients[1].state(), SyncState::AwaitingPull);

    // The pull brings the two missed operations.
    hub.receive(1, reply.unwrap());
    let history = hub.inboxes[1].pop_front().unwrap();
    let ServerMessage::History {
        start_revision,
        ref ops,
        ..
    } = history
    else {
        panic!("expected history");
    };
    assert_eq!(start_revision, 4);
    assert_eq!(ops.len(), 2);

    assert!(clients[1].handle_message(history).is_none());
    assert_eq!(clients[1].content(), "base01234");
    assert_eq!(clients[1].server_revision(), 5);
    assert_eq!(clients[1].state(), SyncState::Synchronized);
}

#[test]
fn simultaneous_inserts_on_empty_doc_respect_priority() {
    let (mut hub, mut clients) = Hub::new("", 2);

    clients[0].apply_edit(&edit(0, 0, "A")).unwrap();
    clients[1].apply_edit(&edit(0, 0, "B")).unwrap();

    // The server serialises A first, so A keeps insertion priority.
    hub.push_from(0, &mut clients[0]);
    hub.push_from(1, &mut clients[1]);
    hub.settle(&mut clients);

    assert_eq!(hub.session.content(), "AB");
    assert_eq!(clients[0].content(), "AB");
    assert_eq!(clients[1].content(), "AB");
}

#[test]
fn history_inconsistency_recovers_through_pull() {
    let (mut hub, mut clients) = Hub::new("abcdef", 1);

    clients[0].apply_edit(&edit(1, 0, "X")).unwrap();
    hub.push_from(0, &mut clients[0]);
    hub.settle(&mut clients);
    assert_eq!(hub.session.revision(), 1);

    // A push whose base length contradicts the stored history entry; the
    // server answers with an error and must not advance the revision.
    let mut bad = TextOperation::new();
    bad.insert("y").retain(3);
    hub.receive(0, ClientMessage::Push { revision: 0, op: bad });
    assert_eq!(hub.session.revision(), 1);

    let error = hub.inboxes[0].pop_front().unwrap();
    assert!(matches!(error, ServerMessage::Error { .. }));
    let reply = clients[0].handle_message(error);
    assert_eq!(reply, Some(ClientMessage::Pull { revision: 1 }));
    assert_eq!(clients[0].state(), SyncState::AwaitingPull);

    hub.receive(0, reply.unwrap());
    hub.settle(&mut clients);

    assert_eq!(clients[0].content(), hub.session.content());
    assert_eq!(clients[0].server_revision(), 1);
    assert_eq!(clients[0].state(), SyncState::Synchronized);
}

#[test]
fn interleaved_edit_rounds_converge() {
    let (mut hub, mut clients) = Hub::new("seed", 2);

    for round in 0..6 {
        let tail = clients[0].content().chars().count();
        clients[0]
            .apply_edit(&edit(tail, 0, &format!("<{round}")))
            .unwrap();
        clients[1].apply_edit(&edit(0, 1, "")).unwrap();

        // Alternate which client reaches the server first.
        if round % 2 == 0 {
            hub.push_from(0, &mut clients[0]);
            hub.push_from(1, &mut clients[1]);
        } else {
            hub.push_from(1, &mut clients[1]);
            hub.push_from(0, &mut clients[0]);
        }
        hub.settle(&mut clients);

        assert_eq!(clients[0].content(), hub.session.content());
        assert_eq!(clients[1].content(), hub.session.content());
    }

    assert_eq!(hub.session.revision(), 12);
    assert_eq!(hub.session.history().len(), 12);
}
