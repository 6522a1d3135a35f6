use serde_json::{Value, json};

use super::channel::{ServerChannel, duplex};
use super::messages::{OutboundMsg, RedirectKind};
use super::{ClientError, ClientProxy, SessionHandle};
use crate::dom::SESSION_ATTR;

fn root_html() -> String {
    format!(r#"<div id="x" {SESSION_ATTR}="token"></div>"#)
}

/// Answer the next outbound message, expecting a join for `topic`.
async fn answer_join(server: &mut ServerChannel, topic: &str, rendered: Value) {
    match server.recv().await.expect("client gone before join") {
        OutboundMsg::Join {
            topic: t, reply, ..
        } => {
            assert_eq!(t, topic);
            let _ = reply.send(Ok(json!({ "rendered": rendered })));
        }
        other => panic!("expected join, got {other:?}"),
    }
}

/// Mount a single root view at `#x` and spawn the session loop.
async fn mounted(rendered: Value) -> (SessionHandle, ServerChannel) {
    let (client, mut server) = duplex(16);
    let (result, ()) = tokio::join!(
        ClientProxy::mount(client, &root_html()),
        answer_join(&mut server, "view:x", rendered),
    );
    let (proxy, handle) = result.expect("mount failed");
    tokio::spawn(proxy.run());
    (handle, server)
}

#[tokio::test]
async fn test_mount_diff_and_empty_diff_noop() {
    let (handle, server) = mounted(json!({
        "s": ["<div id=\"x\">", "</div>"],
        "0": "0",
    }))
    .await;

    let markup = handle.render().await.unwrap();
    assert!(markup.contains(">0</div>"), "got: {markup}");

    server.send_diff("view:x", json!({ "0": "1" })).await.unwrap();
    let markup = handle.render().await.unwrap();
    assert!(markup.contains(">1</div>"), "got: {markup}");

    // An empty diff is a no-op: byte-identical markup.
    let before = handle.render().await.unwrap();
    server.send_diff("view:x", json!({})).await.unwrap();
    let after = handle.render().await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_title_diff_updates_tracked_title() {
    let (handle, server) = mounted(json!({
        "s": ["<div id=\"x\">", "</div>"],
        "0": "hi",
    }))
    .await;

    assert_eq!(handle.title().await.unwrap(), None);
    server
        .send_diff("view:x", json!({ "t": "Dashboard" }))
        .await
        .unwrap();
    assert_eq!(handle.title().await.unwrap().as_deref(), Some("Dashboard"));
}

#[tokio::test]
async fn test_click_round_trip() {
    let (handle, mut server) = mounted(json!({
        "s": [
            "<div id=\"x\"><button wr-click=\"inc\" wr-value-step=\"2\">+</button><span id=\"n\">",
            "</span></div>",
        ],
        "0": "0",
    }))
    .await;

    let serve = async {
        match server.recv().await.unwrap() {
            OutboundMsg::Event {
                topic,
                event,
                payload,
                msg_ref,
            } => {
                assert_eq!(topic, "view:x");
                assert_eq!(event, "event");
                assert_eq!(payload["type"], "click");
                assert_eq!(payload["event"], "inc");
                assert_eq!(payload["value"]["step"], "2");
                server
                    .send_reply(&topic, msg_ref, json!({ "diff": { "0": "2" } }))
                    .await
                    .unwrap();
            }
            other => panic!("expected event push, got {other:?}"),
        }
    };
    let (clicked, ()) = tokio::join!(handle.click("button", None), serve);
    clicked.unwrap();

    let markup = handle.render().await.unwrap();
    assert!(markup.contains(r#"<span id="n">2</span>"#), "got: {markup}");
}

#[tokio::test]
async fn test_submit_serializes_form() {
    let (handle, mut server) = mounted(json!({
        "s": [
            "<div id=\"x\"><form id=\"f\" wr-submit=\"save\">\
             <input name=\"a\" value=\"1\"><input name=\"b\" value=\"2\">\
             </form>",
            "</div>",
        ],
        "0": "",
    }))
    .await;

    let serve = async {
        match server.recv().await.unwrap() {
            OutboundMsg::Event {
                topic,
                payload,
                msg_ref,
                ..
            } => {
                assert_eq!(payload["type"], "form");
                assert_eq!(payload["event"], "save");
                assert_eq!(payload["value"], "a=1&b=9");
                server.send_reply(&topic, msg_ref, json!({})).await.unwrap();
            }
            other => panic!("expected event push, got {other:?}"),
        }
    };
    let (submitted, ()) = tokio::join!(handle.submit("#f", None, json!({ "b": "9" })), serve);
    submitted.unwrap();
}

#[tokio::test]
async fn test_selector_cardinality_errors() {
    let (handle, _server) = mounted(json!({
        "s": ["<div id=\"x\"><button>a</button><button>b</button>", "</div>"],
        "0": "",
    }))
    .await;

    assert!(!handle.has_element("form", None).await.unwrap());
    assert!(handle.has_element("button", Some("a")).await.unwrap());

    let err = handle.click("form", None).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Selector(crate::dom::select::SelectorError::NoMatch { .. })
    ));
    assert!(err.to_string().contains("form"));

    let err = handle.click("button", None).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Selector(crate::dom::select::SelectorError::ManyMatches { .. })
    ));
}

#[tokio::test]
async fn test_click_without_binding_is_local_error() {
    let (handle, _server) = mounted(json!({
        "s": ["<div id=\"x\"><button id=\"b\">dead</button>", "</div>"],
        "0": "",
    }))
    .await;

    let err = handle.click("#b", None).await.unwrap_err();
    assert!(matches!(err, ClientError::NoEventBinding { .. }));

    // The session survives a local error.
    assert!(handle.render().await.is_ok());
}

#[tokio::test]
async fn test_child_view_mounts_and_unmounts() {
    let (client, mut server) = duplex(16);
    let root_rendered = json!({
        "s": [
            &format!("<div id=\"x\"><div id=\"child\" {SESSION_ATTR}=\"ctok\"></div><p>",),
            "</p></div>",
        ],
        "0": "root",
    });
    let child_rendered = json!({
        "s": ["<div id=\"child\">", "</div>"],
        "0": "nested",
    });

    let serve = async {
        answer_join(&mut server, "view:x", root_rendered).await;
        answer_join(&mut server, "view:child", child_rendered).await;
    };
    let (result, ()) = tokio::join!(ClientProxy::mount(client, &root_html()), serve);
    let (proxy, handle) = result.expect("mount failed");
    tokio::spawn(proxy.run());

    let markup = handle.render().await.unwrap();
    assert!(markup.contains("nested"), "got: {markup}");

    // A root diff that drops the child's session marker unmounts it.
    server
        .send_diff("view:x", json!({ "s": ["<div id=\"x\"><p>", "</p></div>"], "0": "alone" }))
        .await
        .unwrap();

    match server.recv().await.unwrap() {
        OutboundMsg::Leave { topic } => assert_eq!(topic, "view:child"),
        other => panic!("expected leave, got {other:?}"),
    }
    let markup = handle.render().await.unwrap();
    assert!(!markup.contains("nested"), "got: {markup}");
}

#[tokio::test]
async fn test_two_phase_component_destroy() {
    let (handle, mut server) = mounted(json!({
        "s": ["<div id=\"x\">", "</div>"],
        "0": 1,
        "c": { "1": { "s": ["<b>", "</b>"], "0": "comp" } },
    }))
    .await;

    let markup = handle.render().await.unwrap();
    assert!(markup.contains("comp"), "got: {markup}");

    // Replace the component slot with plain text: the patch reports cid 1
    // destroyed and the proxy opens the two-phase handshake.
    server.send_diff("view:x", json!({ "0": "plain" })).await.unwrap();

    match server.recv().await.unwrap() {
        OutboundMsg::Event {
            topic,
            event,
            payload,
            msg_ref,
        } => {
            assert_eq!(event, "cids_will_destroy");
            assert_eq!(topic, "view:x");
            assert_eq!(payload["cids"], json!([1]));
            server.send_reply(&topic, msg_ref, json!({})).await.unwrap();
        }
        other => panic!("expected cids_will_destroy, got {other:?}"),
    }

    match server.recv().await.unwrap() {
        OutboundMsg::Event {
            topic,
            event,
            payload,
            msg_ref,
        } => {
            assert_eq!(event, "cids_destroyed");
            assert_eq!(payload["cids"], json!([1]));
            server
                .send_reply(&topic, msg_ref, json!({ "cids": [1] }))
                .await
                .unwrap();
        }
        other => panic!("expected cids_destroyed, got {other:?}"),
    }

    let markup = handle.render().await.unwrap();
    assert!(markup.contains("plain"), "got: {markup}");
}

#[tokio::test]
async fn test_server_drop_fails_pending_click() {
    let (handle, mut server) = mounted(json!({
        "s": ["<div id=\"x\"><button wr-click=\"go\">go</button>", "</div>"],
        "0": "",
    }))
    .await;

    let click = handle.click("button", None);
    let serve = async {
        // Consume the push, then die without replying.
        let _ = server.recv().await;
        drop(server);
    };
    let (result, ()) = tokio::join!(click, serve);
    let err = result.unwrap_err();
    assert!(
        matches!(err, ClientError::SessionTerminated { .. }),
        "got: {err}"
    );
}

#[tokio::test]
async fn test_redirect_fails_pending_and_stops_session() {
    let (handle, mut server) = mounted(json!({
        "s": ["<div id=\"x\"><button wr-click=\"go\">go</button>", "</div>"],
        "0": "",
    }))
    .await;

    let click = handle.click("button", None);
    let serve = async {
        let _ = server.recv().await;
        server
            .send_redirect("view:x", RedirectKind::Redirect, "/elsewhere")
            .await
            .unwrap();
    };
    let (result, ()) = tokio::join!(click, serve);
    assert!(matches!(
        result.unwrap_err(),
        ClientError::Redirected { to } if to == "/elsewhere"
    ));

    // The session terminated: subsequent requests fail.
    assert!(handle.render().await.is_err());
}

#[tokio::test]
async fn test_stop_leaves_tracked_views() {
    let (handle, mut server) = mounted(json!({
        "s": ["<div id=\"x\">", "</div>"],
        "0": "hi",
    }))
    .await;

    handle.stop().await.unwrap();
    match server.recv().await.unwrap() {
        OutboundMsg::Leave { topic } => assert_eq!(topic, "view:x"),
        other => panic!("expected leave, got {other:?}"),
    }
    assert!(matches!(
        handle.render().await.unwrap_err(),
        ClientError::SessionClosed | ClientError::Timeout
    ));
}

#[tokio::test]
async fn test_stream_diff_inserts_into_container() {
    let (handle, server) = mounted(json!({
        "s": ["<div id=\"x\"><ul id=\"songs\" wr-update=\"stream\">", "</ul></div>"],
        "0": {
            "s": ["<li id=\"", "\">", "</li>"],
            "d": [["songs-1", "one"]],
            "stream": ["songs", [["songs-1", -1, null, false]], []],
        },
    }))
    .await;

    let markup = handle.render().await.unwrap();
    assert!(markup.contains("one"), "got: {markup}");

    // A follow-up stream op prepends a second item.
    server
        .send_diff(
            "view:x",
            json!({
                "0": {
                    "d": [["songs-2", "two"]],
                    "stream": ["songs", [["songs-2", 0, null, false]], []],
                },
            }),
        )
        .await
        .unwrap();

    let markup = handle.render().await.unwrap();
    let two = markup.find("two").unwrap();
    let one = markup.find("one").unwrap();
    assert!(two < one, "two should precede one: {markup}");
}
