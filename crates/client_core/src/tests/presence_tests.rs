use super::*;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|name| name.to_string()).collect()
}

#[test]
fn snapshot_then_updates_drive_online_set() {
    let mut presence = PresenceTracker::default();
    presence.apply_snapshot(vec![UserId(2), UserId(1)]);
    assert_eq!(presence.online_users(), vec![UserId(1), UserId(2)]);

    assert!(presence.apply_update(UserId(3), true));
    assert!(!presence.apply_update(UserId(3), true));
    assert!(presence.apply_update(UserId(1), false));
    assert!(!presence.is_online(UserId(1)));
    assert!(presence.is_online(UserId(3)));

    presence.clear();
    assert!(presence.online_users().is_empty());
}

#[test]
fn typing_indicator_self_expires_without_stop_event() {
    let start = Instant::now();
    let mut typing = TypingTracker::default();
    typing.apply(ConversationId(1), UserId(2), true, start);
    assert_eq!(
        typing.typing_users(ConversationId(1), start + Duration::from_millis(1500)),
        vec![UserId(2)]
    );

    let later = start + Duration::from_millis(2100);
    assert!(typing.typing_users(ConversationId(1), later).is_empty());
    let affected = typing.expire(later);
    assert!(affected.contains(&ConversationId(1)));
    assert!(typing.expire(later).is_empty());
}

#[test]
fn renewed_typing_event_extends_the_window() {
    let start = Instant::now();
    let mut typing = TypingTracker::default();
    typing.apply(ConversationId(1), UserId(2), true, start);
    typing.apply(
        ConversationId(1),
        UserId(2),
        true,
        start + Duration::from_millis(1500),
    );
    assert_eq!(
        typing.typing_users(ConversationId(1), start + Duration::from_millis(3000)),
        vec![UserId(2)]
    );
    assert!(typing.apply(ConversationId(1), UserId(2), false, start));
    assert!(typing.typing_users(ConversationId(1), start).is_empty());
}

#[test]
fn typing_is_scoped_per_conversation() {
    let now = Instant::now();
    let mut typing = TypingTracker::default();
    typing.apply(ConversationId(1), UserId(2), true, now);
    typing.apply(ConversationId(2), UserId(3), true, now);
    assert_eq!(typing.typing_users(ConversationId(2), now), vec![UserId(3)]);
}

#[test]
fn typing_label_pluralizes_after_two_names() {
    assert_eq!(typing_label(&[]), None);
    assert_eq!(
        typing_label(&names(&["Ana"])).as_deref(),
        Some("Ana is typing…")
    );
    assert_eq!(
        typing_label(&names(&["Ana", "Ben"])).as_deref(),
        Some("Ana and Ben are typing…")
    );
    assert_eq!(
        typing_label(&names(&["Ana", "Ben", "Cleo"])).as_deref(),
        Some("Ana, Ben and 1 other are typing…")
    );
    assert_eq!(
        typing_label(&names(&["Ana", "Ben", "Cleo", "Dan"])).as_deref(),
        Some("Ana, Ben and 2 others are typing…")
    );
}

#[test]
fn notifier_starts_and_stops_after_idle_window() {
    let start = Instant::now();
    let mut notifier = TypingNotifier::default();
    assert_eq!(
        notifier.keystroke(ConversationId(1), start),
        vec![TypingSignal::Start(ConversationId(1))]
    );
    assert!(notifier
        .keystroke(ConversationId(1), start + Duration::from_millis(500))
        .is_empty());
    assert_eq!(notifier.tick(start + Duration::from_millis(2000)), None);
    assert_eq!(
        notifier.tick(start + Duration::from_millis(2500)),
        Some(TypingSignal::Stop(ConversationId(1)))
    );
    assert_eq!(notifier.tick(start + Duration::from_millis(5000)), None);
}

#[test]
fn notifier_repeats_start_while_typing_continues() {
    let start = Instant::now();
    let mut notifier = TypingNotifier::default();
    let starts = (0..=6)
        .map(|step| start + Duration::from_millis(500 * step))
        .filter(|at| !notifier.keystroke(ConversationId(1), *at).is_empty())
        .count();
    assert_eq!(starts, 4);
    assert_eq!(notifier.tick(start + Duration::from_millis(4000)), None);
    assert_eq!(
        notifier.tick(start + Duration::from_millis(5000)),
        Some(TypingSignal::Stop(ConversationId(1)))
    );
}

#[test]
fn repeated_start_keeps_remote_indicator_alive() {
    let start = Instant::now();
    let mut typing = TypingTracker::default();
    assert!(typing.apply(ConversationId(1), UserId(2), true, start));
    assert!(!typing.apply(
        ConversationId(1),
        UserId(2),
        true,
        start + Duration::from_millis(1500)
    ));
    assert!(typing
        .expire(start + Duration::from_millis(2500))
        .is_empty());
    assert_eq!(
        typing.typing_users(ConversationId(1), start + Duration::from_millis(2500)),
        vec![UserId(2)]
    );
    assert_eq!(
        typing.expire(start + Duration::from_millis(3500)),
        BTreeSet::from([ConversationId(1)])
    );
}

#[test]
fn switching_conversation_stops_previous_typing() {
    let now = Instant::now();
    let mut notifier = TypingNotifier::default();
    notifier.keystroke(ConversationId(1), now);
    assert_eq!(
        notifier.keystroke(ConversationId(2), now),
        vec![
            TypingSignal::Stop(ConversationId(1)),
            TypingSignal::Start(ConversationId(2)),
        ]
    );
    assert_eq!(notifier.stop(), Some(TypingSignal::Stop(ConversationId(2))));
    assert_eq!(notifier.stop(), None);
}

#[test]
fn typing_signal_maps_to_wire_command() {
    assert_eq!(
        TypingSignal::Start(ConversationId(4)).into_command(UserId(9)),
        ClientCommand::TypingStart {
            conversation_id: ConversationId(4),
            user_id: UserId(9),
        }
    );
}
