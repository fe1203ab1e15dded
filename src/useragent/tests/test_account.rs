use crate::useragent::account::{Account, AccountError, AnswerMode, DecodeError};
use crate::useragent::stun::StunScheme;

fn decode(s: &str) -> Account {
    Account::decode(s).expect("decode").account
}

#[test]
fn test_credentials_from_uri() {
    for (user, password, host) in [
        ("alice", "secret", "example.com"),
        ("bob", "p4ss.word", "sip.example.org:5080"),
        ("alice", "se.cret", "example.com"),
        ("carol", "a:b.c", "sip.example.net"),
        ("1001", "x", "10.0.0.1"),
    ] {
        let account = decode(&format!("<sip:{}:{}@{}>", user, password, host));
        assert_eq!(account.authentication().user.as_deref(), Some(user));
        assert_eq!(account.authentication().password.as_deref(), Some(password));
        assert!(!account.aor().contains(password), "aor {}", account.aor());
        assert_eq!(account.aor(), format!("sip:{}@{}", user, host));
    }
}

#[test]
fn test_aor_strips_params() {
    let account = decode("\"Alice\" <sip:alice:secret@example.com;transport=tcp>;regint=60");
    assert_eq!(account.aor(), "sip:alice@example.com");
    assert_eq!(account.display_name(), Some("Alice"));
    assert_eq!(account.registration_interval(), 60);
    assert_eq!(account.user(), Some("alice"));
}

#[test]
fn test_default_registration_interval() {
    let account = decode("<sip:alice:secret@example.com>");
    let regint = account.registration_interval();
    assert!((3600..3600 + 256).contains(&regint), "regint {}", regint);
    assert_eq!(account.publish_interval(), 0);
    assert_eq!(account.packet_time(), 20);
}

#[test]
fn test_outbound_legacy_fallback() {
    let legacy = decode("<sip:alice:secret@example.com>;outbound=\"sip:proxy.example.com;lr\"");
    let indexed = decode("<sip:alice:secret@example.com>;outbound1=\"sip:proxy.example.com;lr\"");
    assert_eq!(legacy.outbound(0), Some("sip:proxy.example.com;lr"));
    assert_eq!(legacy.outbound(0), indexed.outbound(0));

    let both = decode(
        "<sip:alice:secret@example.com>;outbound=sip:old.example.com;outbound1=sip:new.example.com;outbound2=sip:backup.example.com",
    );
    assert_eq!(both.outbound(0), Some("sip:new.example.com"));
    assert_eq!(both.outbound(1), Some("sip:backup.example.com"));
    assert_eq!(both.outbound(2), None);
    assert_eq!(both.outbound_proxies().count(), 2);
}

#[test]
fn test_answer_mode() {
    let bogus = Account::decode("<sip:alice:secret@example.com>;answermode=bogus").unwrap();
    assert_eq!(bogus.account.answer_mode(), AnswerMode::Manual);
    assert!(bogus.report.has_issue("answermode"));

    let early = decode("<sip:alice:secret@example.com>;answermode=early");
    assert_eq!(early.answer_mode(), AnswerMode::Early);
    let auto = decode("<sip:alice:secret@example.com>;answermode=AUTO");
    assert_eq!(auto.answer_mode(), AnswerMode::Auto);
    assert_eq!(decode("<sip:alice:secret@example.com>").answer_mode(), AnswerMode::Manual);
}

#[test]
fn test_sip_nat() {
    let account = decode("<sip:alice:secret@example.com>;sipnat=outbound");
    assert_eq!(account.sip_nat(), Some("outbound"));

    let err = Account::decode("<sip:alice:secret@example.com>;sipnat=foo").unwrap_err();
    assert_eq!(err, DecodeError::InvalidSipNat("foo".to_string()));
}

#[test]
fn test_audio_codec_order() {
    let account = decode("<sip:alice:secret@example.com>;audio_codecs=PCMU/8000/1,opus/48000/2");
    let names: Vec<&str> = account.audio_codecs().iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["PCMU", "opus"]);

    let decoded = Account::decode(
        "<sip:alice:secret@example.com>;audio_codecs=PCMU/8000/1, nosuch/8000 ,opus/48000/2",
    )
    .unwrap();
    let names: Vec<&str> = decoded.account.audio_codecs().iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["PCMU", "opus"]);
    assert!(decoded.report.has_issue("audio_codecs"));
}

#[test]
fn test_audio_codec_defaults() {
    let account = decode("<sip:alice:secret@example.com>;audio_codecs=pcma,G722/16000");
    let codecs: Vec<String> = account.audio_codecs().iter().map(|c| c.to_string()).collect();
    assert_eq!(codecs, vec!["PCMA/8000/1", "G722/16000/1"]);

    let empty = decode("<sip:alice:secret@example.com>");
    assert!(empty.audio_codecs().is_empty());
    assert!(!empty.audio_codec_list().is_empty());
}

#[cfg(feature = "video")]
#[test]
fn test_video_codecs() {
    let account = decode("<sip:alice:secret@example.com>;video_codecs=vp8,bogus,H264");
    let names: Vec<&str> = account.video_codecs().iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["VP8", "H264"]);
}

#[test]
fn test_invalid_address() {
    for input in ["<sip:bad uri>", "", "alice@example.com", "<http://example.com>", "<sip:@>"] {
        match Account::decode(input) {
            Err(DecodeError::InvalidAddress(_)) => {}
            other => panic!("{:?} decoded to {:?}", input, other.map(|d| d.account)),
        }
    }
}

#[test]
fn test_missing_password() {
    let decoded = Account::decode("<sip:alice@example.com>").unwrap();
    assert_eq!(decoded.account.authentication().password, None);
    assert!(decoded.report.has_issue("password"));
}

#[test]
fn test_auth_user_param() {
    let account = decode("<sip:alice:secret@example.com>;auth_user=alice-auth");
    assert_eq!(account.authentication().user.as_deref(), Some("alice-auth"));
}

#[test]
fn test_media_params() {
    let decoded = Account::decode(
        "<sip:alice:secret@example.com>;mediaenc=srtp-mand;medianat=ice;rtpkeep=zero;ptime=40;stunserver=stun:stun.example.com:3479;stunuser=su;stunpass=sp",
    )
    .unwrap();
    let account = decoded.account;
    assert!(decoded.report.is_clean(), "{:?}", decoded.report.issues());
    assert!(account.media_encryption().unwrap().is_resolved());
    assert_eq!(account.media_nat().unwrap().id, "ice");
    assert_eq!(account.rtp_keepalive(), Some("zero"));
    assert_eq!(account.packet_time(), 40);
    let stun = account.stun_uri().unwrap();
    assert_eq!(stun.scheme, StunScheme::Stun);
    assert_eq!(account.stun_host(), Some("stun.example.com"));
    assert_eq!(account.stun_port(), 3479);
    assert_eq!(account.stun_user(), Some("su"));
    assert_eq!(account.stun_password(), Some("sp"));
}

#[test]
fn test_unknown_plugins_degrade() {
    let decoded = Account::decode(
        "<sip:alice:secret@example.com>;medianat=nosuch;mediaenc=rot13;stunserver=ftp:x",
    )
    .unwrap();
    let account = decoded.account;
    let nat = account.media_nat().unwrap();
    assert_eq!(nat.id, "nosuch");
    assert!(!nat.is_resolved());
    assert!(!account.media_encryption().unwrap().is_resolved());
    assert!(account.stun_uri().is_none());
    assert!(decoded.report.has_issue("medianat"));
    assert!(decoded.report.has_issue("mediaenc"));
    assert!(decoded.report.has_issue("stunserver"));
}

#[test]
fn test_stun_ignored_without_medianat() {
    let account = decode("<sip:alice:secret@example.com>;stunserver=stun:stun.example.com");
    assert!(account.stun().is_none());
    assert_eq!(account.stun_port(), 0);
}

#[test]
fn test_setters() {
    let mut account = decode("<sip:alice:secret@example.com>");
    account.set_display_name(Some("Alice"));
    account.set_auth_user(Some("a1"));
    account.set_registration_interval(120);
    account.set_answer_mode(AnswerMode::Auto);
    assert_eq!(account.display_name(), Some("Alice"));
    assert_eq!(account.authentication().user.as_deref(), Some("a1"));
    assert_eq!(account.registration_interval(), 120);
    assert_eq!(account.answer_mode(), AnswerMode::Auto);

    account.set_outbound(Some("sip:proxy.example.com"), 1).unwrap();
    assert_eq!(account.outbound(1), Some("sip:proxy.example.com"));
    assert_eq!(
        account.set_outbound(Some("sip:x"), 2),
        Err(AccountError::OutboundIndex(2))
    );

    assert!(account.set_sip_nat(Some("bogus")).is_err());
    account.set_sip_nat(Some("outbound")).unwrap();
    assert_eq!(account.sip_nat(), Some("outbound"));

    assert!(account.set_media_nat(Some("nosuch")).is_err());
    account.set_media_nat(Some("turn")).unwrap();
    assert!(account.media_nat().unwrap().is_resolved());
    assert!(account.set_media_encryption(Some("zrtp")).is_ok());
    account.set_media_encryption(None).unwrap();
    assert!(account.media_encryption().is_none());

    account.set_stun_host("ignored.example.com").unwrap();
    assert_eq!(account.stun_host(), None);
    account.set_stun_uri(Some("turn:turn.example.com?transport=tcp")).unwrap();
    assert!(account.set_stun_uri(Some("nonsense")).is_err());
    assert_eq!(account.stun_host(), Some("turn.example.com"));
    account.set_stun_host("relay.example.com").unwrap();
    account.set_stun_port(3480);
    assert_eq!(account.stun_host(), Some("relay.example.com"));
    assert_eq!(account.stun_port(), 3480);
    assert!(account.set_stun_host("").is_err());
}

#[test]
fn test_display_dump() {
    let account = decode(
        "\"Alice\" <sip:alice:secret@example.com>;regint=300;audio_codecs=PCMU;medianat=ice",
    );
    let dump = account.to_string();
    assert!(dump.contains(" aor:          sip:alice@example.com"));
    assert!(dump.contains(" dispname:     Alice"));
    assert!(dump.contains(" regint:       300"));
    assert!(dump.contains(" audio_codecs: PCMU/8000/1"));
    assert!(dump.contains(" medianat:     ice"));
    assert!(!dump.contains("secret"));
}
