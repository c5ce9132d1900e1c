//! Introspection XML.

use {
    crate::descriptor::{EmitsChange, InterfaceDescriptor},
    buslane_wire::Signature,
    std::fmt::Write,
};

const HEADER: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
"#;

const STANDARD: &str = r#"  <interface name="org.freedesktop.DBus.Peer">
    <method name="Ping"/>
    <method name="GetMachineId">
      <arg name="machine_uuid" type="s" direction="out"/>
    </method>
  </interface>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect">
      <arg name="xml_data" type="s" direction="out"/>
    </method>
  </interface>
"#;

const PROPERTIES: &str = r#"  <interface name="org.freedesktop.DBus.Properties">
    <method name="Get">
      <arg name="interface_name" type="s" direction="in"/>
      <arg name="property_name" type="s" direction="in"/>
      <arg name="value" type="v" direction="out"/>
    </method>
    <method name="GetAll">
      <arg name="interface_name" type="s" direction="in"/>
      <arg name="props" type="a{sv}" direction="out"/>
    </method>
    <method name="Set">
      <arg name="interface_name" type="s" direction="in"/>
      <arg name="property_name" type="s" direction="in"/>
      <arg name="value" type="v" direction="in"/>
    </method>
    <signal name="PropertiesChanged">
      <arg name="interface_name" type="s"/>
      <arg name="changed_properties" type="a{sv}"/>
      <arg name="invalidated_properties" type="as"/>
    </signal>
  </interface>
"#;

const OBJECT_MANAGER: &str = r#"  <interface name="org.freedesktop.DBus.ObjectManager">
    <method name="GetManagedObjects">
      <arg name="objects" type="a{oa{sa{sv}}}" direction="out"/>
    </method>
    <signal name="InterfacesAdded">
      <arg name="object_path" type="o"/>
      <arg name="interfaces_and_properties" type="a{sa{sv}}"/>
    </signal>
    <signal name="InterfacesRemoved">
      <arg name="object_path" type="o"/>
      <arg name="interfaces" type="as"/>
    </signal>
  </interface>
"#;

fn args(out: &mut String, signature: &Signature, direction: Option<&str>) {
    for ty in signature.types() {
        let _ = match direction {
            Some(d) => writeln!(out, r#"      <arg type="{ty}" direction="{d}"/>"#),
            None => writeln!(out, r#"      <arg type="{ty}"/>"#),
        };
    }
}

fn interface(out: &mut String, d: &InterfaceDescriptor) {
    let _ = writeln!(out, r#"  <interface name="{}">"#, d.name());
    for m in d.methods() {
        if m.input.is_empty() && m.output.is_empty() && !m.no_reply {
            let _ = writeln!(out, r#"    <method name="{}"/>"#, m.name);
            continue;
        }
        let _ = writeln!(out, r#"    <method name="{}">"#, m.name);
        args(out, &m.input, Some("in"));
        args(out, &m.output, Some("out"));
        if m.no_reply {
            out.push_str(
                "      <annotation name=\"org.freedesktop.DBus.Method.NoReply\" value=\"true\"/>\n",
            );
        }
        out.push_str("    </method>\n");
    }
    for s in d.signals() {
        if s.signature.is_empty() {
            let _ = writeln!(out, r#"    <signal name="{}"/>"#, s.name);
            continue;
        }
        let _ = writeln!(out, r#"    <signal name="{}">"#, s.name);
        args(out, &s.signature, None);
        out.push_str("    </signal>\n");
    }
    for p in d.properties() {
        let head = format!(
            r#"    <property name="{}" type="{}" access="{}""#,
            p.name,
            p.ty,
            p.access.as_str()
        );
        match p.emits_change {
            EmitsChange::True => {
                let _ = writeln!(out, "{head}/>");
            }
            e => {
                let _ = writeln!(out, "{head}>");
                let _ = writeln!(
                    out,
                    r#"      <annotation name="org.freedesktop.DBus.Property.EmitsChangedSignal" value="{}"/>"#,
                    e.as_str()
                );
                out.push_str("    </property>\n");
            }
        }
    }
    out.push_str("  </interface>\n");
}

/// Describes an object.
///
/// `children` are the names of the direct child nodes.
pub(crate) fn xml(
    interfaces: &[&InterfaceDescriptor],
    children: &[&str],
    object_manager: bool,
) -> String {
    let mut out = String::from(HEADER);
    out.push_str("<node>\n");
    out.push_str(STANDARD);
    if !interfaces.is_empty() {
        out.push_str(PROPERTIES);
    }
    if object_manager {
        out.push_str(OBJECT_MANAGER);
    }
    for d in interfaces {
        interface(&mut out, d);
    }
    for c in children {
        let _ = writeln!(out, r#"  <node name="{c}"/>"#);
    }
    out.push_str("</node>\n");
    out
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::descriptor::{Access, InterfaceDescriptor},
    };

    /// Checks that every element is closed in order.
    fn balanced(xml: &str) -> bool {
        let mut stack = vec![];
        let body = &xml[xml.find("<node>").unwrap()..];
        for tag in body.split('<').skip(1) {
            let tag = &tag[..tag.find('>').unwrap()];
            if let Some(name) = tag.strip_prefix('/') {
                if stack.pop() != Some(name.to_string()) {
                    return false;
                }
            } else if !tag.ends_with('/') {
                stack.push(tag.split(' ').next().unwrap().to_string());
            }
        }
        stack.is_empty()
    }

    #[test]
    fn describes_members() {
        let d = InterfaceDescriptor::builder("org.example.interface")
            .method("upper", "s", "s")
            .method("reset", "", "")
            .method_no_reply("poke", "u")
            .property("hello_world", "s", Access::Read, EmitsChange::False)
            .property("count", "u", Access::ReadWrite, EmitsChange::True)
            .signal("clock", "i")
            .build()
            .unwrap();
        let xml = xml(&[&d], &["child", "other"], true);
        assert!(xml.starts_with("<!DOCTYPE node PUBLIC"));
        assert!(balanced(&xml), "{xml}");
        for needle in [
            r#"<interface name="org.example.interface">"#,
            r#"<method name="upper">"#,
            r#"<arg type="s" direction="in"/>"#,
            r#"<arg type="s" direction="out"/>"#,
            r#"<method name="reset"/>"#,
            r#"value="true"/>"#,
            r#"<signal name="clock">"#,
            r#"<arg type="i"/>"#,
            r#"<property name="hello_world" type="s" access="read">"#,
            r#"<property name="count" type="u" access="readwrite"/>"#,
            r#"<node name="child"/>"#,
            "org.freedesktop.DBus.ObjectManager",
            "org.freedesktop.DBus.Properties",
        ] {
            assert!(xml.contains(needle), "missing {needle} in {xml}");
        }
    }

    #[test]
    fn intermediate_nodes() {
        let xml = xml(&[], &["a"], false);
        assert!(balanced(&xml));
        assert!(!xml.contains("org.freedesktop.DBus.Properties"));
        assert!(xml.contains("org.freedesktop.DBus.Introspectable"));
    }
}
