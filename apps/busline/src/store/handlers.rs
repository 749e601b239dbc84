//! Dispatcher handlers that apply server notifications to a [`Store`].

use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{ImStatus, MessagePatch, Origin, PersonaId, RecordSet, Store, ThreadKey, ThreadPatch};
use crate::dispatch::{DispatchError, Dispatcher, HandlerError, HandlerRegistration};
use crate::protocol::{Envelope, kinds};

#[derive(Debug, Deserialize)]
struct NewMessage {
    /// Channel id the message was posted in.
    id: i64,
    message: MessagePatch,
}

#[derive(Debug, Deserialize)]
struct MessageIds {
    message_ids: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct ToggleStar {
    message_ids: Vec<u64>,
    starred: bool,
}

#[derive(Debug, Deserialize)]
struct Seen {
    thread: ThreadKey,
    seen_message_id: u64,
    #[serde(default)]
    persona_id: Option<PersonaId>,
}

#[derive(Debug, Deserialize)]
struct PresenceUpdate {
    persona_id: PersonaId,
    im_status: ImStatus,
}

fn decode<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, HandlerError> {
    T::deserialize(&envelope.payload).map_err(|err| HandlerError::payload(&envelope.kind, err))
}

fn insert_records(store: &Store, envelope: &Envelope) -> Result<(), HandlerError> {
    let records: RecordSet = decode(envelope)?;
    store.insert_records(records, Origin::Server);
    Ok(())
}

fn new_message(store: &Store, envelope: &Envelope) -> Result<(), HandlerError> {
    let NewMessage { id, mut message } = decode(envelope)?;
    let key = message.thread.get_or_insert_with(|| ThreadKey::channel(id)).clone();
    if store.thread(&key).is_none() {
        store.insert_thread(ThreadPatch::new(&key), Origin::Server)?;
    }
    store.insert_message(message, Origin::Server)?;
    Ok(())
}

fn delete_messages(store: &Store, envelope: &Envelope) -> Result<(), HandlerError> {
    let MessageIds { message_ids } = decode(envelope)?;
    store.delete_messages(&message_ids, Origin::Server);
    Ok(())
}

fn toggle_star(store: &Store, envelope: &Envelope) -> Result<(), HandlerError> {
    let ToggleStar {
        message_ids,
        starred,
    } = decode(envelope)?;
    store.set_starred(&message_ids, starred, Origin::Server);
    Ok(())
}

fn thread_seen(store: &Store, envelope: &Envelope) -> Result<(), HandlerError> {
    let seen: Seen = decode(envelope)?;
    // Other members' read markers do not move ours.
    if seen.persona_id.is_some() && seen.persona_id != store.self_persona() {
        return Ok(());
    }
    store.mark_seen(&seen.thread, seen.seen_message_id, Origin::Server)?;
    Ok(())
}

fn presence(store: &Store, envelope: &Envelope) -> Result<(), HandlerError> {
    let update: PresenceUpdate = decode(envelope)?;
    store.set_im_status(update.persona_id, update.im_status);
    Ok(())
}

type Apply = fn(&Store, &Envelope) -> Result<(), HandlerError>;

const HANDLERS: [(&str, Apply); 6] = [
    (kinds::RECORD_INSERT, insert_records),
    (kinds::NEW_MESSAGE, new_message),
    (kinds::MESSAGE_DELETE, delete_messages),
    (kinds::MESSAGE_TOGGLE_STAR, toggle_star),
    (kinds::THREAD_SEEN, thread_seen),
    (kinds::PRESENCE, presence),
];

/// Register a handler for every store notification type.
pub fn install(
    dispatcher: &Dispatcher,
    store: Arc<Store>,
) -> Result<Vec<HandlerRegistration>, DispatchError> {
    HANDLERS
        .iter()
        .map(|&(kind, apply)| {
            let store = Arc::clone(&store);
            dispatcher.register(kind, move |envelope: &Envelope| -> Result<(), HandlerError> {
                apply(&store, envelope)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchOutcome;
    use crate::store::MessageId;
    use serde_json::json;

    fn setup() -> (Dispatcher, Arc<Store>, Vec<HandlerRegistration>) {
        let dispatcher = Dispatcher::new();
        let store = Arc::new(Store::new(Some(PersonaId(1))));
        let registrations = install(&dispatcher, Arc::clone(&store)).expect("install");
        (dispatcher, store, registrations)
    }

    #[test]
    fn new_message_creates_the_channel_when_missing() {
        let (dispatcher, store, _registrations) = setup();
        let outcome = dispatcher.dispatch(&Envelope::new(
            1,
            kinds::NEW_MESSAGE,
            json!({"id": 7, "message": {"id": 70, "author_id": 2, "body": "hi"}}),
        ));
        assert_eq!(outcome, DispatchOutcome::Handled);
        let key = ThreadKey::channel(7);
        assert_eq!(
            store.thread(&key).map(|thread| thread.messages),
            Some(vec![MessageId::persisted(70)])
        );
        assert_eq!(store.unread_count(&key), Some(1));
    }

    #[test]
    fn seen_from_another_member_is_ignored() {
        let (dispatcher, store, _registrations) = setup();
        let key = ThreadKey::channel(1);
        store
            .insert_thread(ThreadPatch::new(&key), Origin::Server)
            .expect("thread");
        store
            .insert_message(MessagePatch::new(3, &key).by(PersonaId(2)), Origin::Server)
            .expect("message");

        dispatcher.dispatch(&Envelope::new(
            1,
            kinds::THREAD_SEEN,
            json!({"thread": {"model": "discuss.channel", "id": 1}, "seen_message_id": 3, "persona_id": 2}),
        ));
        assert_eq!(store.unread_count(&key), Some(1));

        dispatcher.dispatch(&Envelope::new(
            2,
            kinds::THREAD_SEEN,
            json!({"thread": {"model": "discuss.channel", "id": 1}, "seen_message_id": 3, "persona_id": 1}),
        ));
        assert_eq!(store.unread_count(&key), Some(0));
    }

    #[test]
    fn malformed_payload_fails_without_touching_the_store() {
        let (dispatcher, store, _registrations) = setup();
        let outcome = dispatcher.dispatch(&Envelope::new(
            1,
            kinds::MESSAGE_TOGGLE_STAR,
            json!({"message_ids": "all"}),
        ));
        assert_eq!(outcome, DispatchOutcome::Failed);
        assert!(store.threads().is_empty());
    }

    #[test]
    fn presence_updates_persona_status() {
        let (dispatcher, store, _registrations) = setup();
        dispatcher.dispatch(&Envelope::new(
            1,
            kinds::PRESENCE,
            json!({"persona_id": 4, "im_status": "away"}),
        ));
        assert_eq!(
            store.persona(PersonaId(4)).map(|persona| persona.im_status),
            Some(ImStatus::Away)
        );
    }

    #[test]
    fn installing_twice_is_rejected() {
        let (dispatcher, store, _registrations) = setup();
        assert!(install(&dispatcher, store).is_err());
    }
}
