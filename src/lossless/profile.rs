//! Settings.xml surgery for Lossless Scaling.
//!
//! The file belongs to another application, so edits are surgical: only the
//! targeted elements change, everything else passes through the event
//! stream untouched. The host backs up the handful of globals it rewrites
//! and restores them on teardown.

use std::io::Cursor;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};

use super::PROFILE_TITLE;
use crate::apps::LosslessOverrides;

/// The globals swapped for a session, captured for restore.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileBackup {
    pub auto_scale: Option<String>,
    pub auto_scale_delay: Option<String>,
    pub lsfg3_target: Option<String>,
}

impl ProfileBackup {
    /// Capture the current values before the session overwrites them.
    pub fn capture(xml: &str) -> Self {
        Self {
            auto_scale: read_setting(xml, "AutoScale"),
            auto_scale_delay: read_setting(xml, "AutoScaleDelay"),
            lsfg3_target: read_setting(xml, "LSFG3Target"),
        }
    }

    /// Write the captured values back and drop the injected profile.
    pub fn restore(&self, xml: &str) -> String {
        let mut out = xml.to_string();
        if let Some(v) = &self.auto_scale {
            out = write_setting(&out, "AutoScale", v);
        }
        if let Some(v) = &self.auto_scale_delay {
            out = write_setting(&out, "AutoScaleDelay", v);
        }
        if let Some(v) = &self.lsfg3_target {
            out = write_setting(&out, "LSFG3Target", v);
        }
        remove_profile(&out, PROFILE_TITLE)
    }
}

/// Read the text of the first element named `tag`.
pub fn read_setting(xml: &str, tag: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut inside = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == tag.as_bytes() => inside = true,
            Ok(Event::Text(t)) if inside => {
                return Some(t.unescape().ok()?.into_owned());
            }
            Ok(Event::End(e)) if inside && e.name().as_ref() == tag.as_bytes() => {
                // Element present but empty
                return Some(String::new());
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == tag.as_bytes() => {
                return Some(String::new());
            }
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
    }
}

/// Set the text of the first element named `tag`, creating the element just
/// before the document end when it does not exist.
pub fn write_setting(xml: &str, tag: &str, value: &str) -> String {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut inside = false;
    let mut wrote_text = false;
    let mut replaced = false;
    let mut depth = 0usize;

    loop {
        let event = match reader.read_event() {
            Ok(Event::Eof) => break,
            Ok(event) => event,
            Err(_) => return xml.to_string(),
        };
        let result = match event {
            Event::Start(e) => {
                depth += 1;
                if !replaced && e.name().as_ref() == tag.as_bytes() {
                    inside = true;
                    wrote_text = false;
                }
                writer.write_event(Event::Start(e))
            }
            Event::Empty(e) if !replaced && e.name().as_ref() == tag.as_bytes() => {
                // Expand <Tag/> into <Tag>value</Tag>
                replaced = true;
                writer
                    .write_event(Event::Start(BytesStart::new(tag)))
                    .and_then(|_| writer.write_event(Event::Text(BytesText::new(value))))
                    .and_then(|_| writer.write_event(Event::End(BytesEnd::new(tag))))
            }
            Event::Text(t) => {
                if inside {
                    wrote_text = true;
                    writer.write_event(Event::Text(BytesText::new(value)))
                } else {
                    writer.write_event(Event::Text(t))
                }
            }
            Event::End(e) => {
                depth = depth.saturating_sub(1);
                if inside && e.name().as_ref() == tag.as_bytes() {
                    if !wrote_text {
                        let _ = writer.write_event(Event::Text(BytesText::new(value)));
                    }
                    inside = false;
                    replaced = true;
                }
                if depth == 0 && !replaced {
                    // Element missing entirely: append before the root closes
                    replaced = true;
                    let _ = writer.write_event(Event::Start(BytesStart::new(tag)));
                    let _ = writer.write_event(Event::Text(BytesText::new(value)));
                    let _ = writer.write_event(Event::End(BytesEnd::new(tag)));
                }
                writer.write_event(Event::End(e))
            }
            other => writer.write_event(other),
        };
        if result.is_err() {
            return xml.to_string();
        }
    }

    String::from_utf8(writer.into_inner().into_inner()).unwrap_or_else(|_| xml.to_string())
}

/// Drop every `<Profile>` whose `<Title>` equals `title`.
pub fn remove_profile(xml: &str, title: &str) -> String {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut buffer: Vec<Event<'static>> = Vec::new();
    let mut in_profile = 0usize;
    let mut in_title = false;
    let mut profile_title = String::new();

    loop {
        let event = match reader.read_event() {
            Ok(Event::Eof) => break,
            Ok(event) => event.into_owned(),
            Err(_) => return xml.to_string(),
        };

        match &event {
            Event::Start(e) if e.name().as_ref() == b"Profile" => {
                in_profile += 1;
                if in_profile == 1 {
                    profile_title.clear();
                }
            }
            Event::Start(e) if in_profile > 0 && e.name().as_ref() == b"Title" => in_title = true,
            Event::Text(t) if in_title => {
                profile_title = t.unescape().map(|s| s.into_owned()).unwrap_or_default();
            }
            Event::End(e) if e.name().as_ref() == b"Title" => in_title = false,
            _ => {}
        }

        if in_profile > 0 {
            let ends_profile =
                matches!(&event, Event::End(e) if e.name().as_ref() == b"Profile");
            buffer.push(event);
            if ends_profile {
                in_profile -= 1;
                if in_profile == 0 {
                    if profile_title != title {
                        for buffered in buffer.drain(..) {
                            if writer.write_event(buffered).is_err() {
                                return xml.to_string();
                            }
                        }
                    } else {
                        buffer.clear();
                    }
                }
            }
        } else if writer.write_event(event).is_err() {
            return xml.to_string();
        }
    }

    String::from_utf8(writer.into_inner().into_inner()).unwrap_or_else(|_| xml.to_string())
}

/// Apply the session profile: global autoscale knobs plus a `Vibeshine`
/// profile built from the app's override bundle.
pub fn apply_vibeshine_profile(
    xml: &str,
    overrides: &LosslessOverrides,
    target_fps: Option<u32>,
) -> String {
    let mut out = write_setting(xml, "AutoScale", "True");
    out = write_setting(&out, "AutoScaleDelay", "0");
    if let Some(fps) = target_fps {
        out = write_setting(&out, "LSFG3Target", &fps.to_string());
    }
    out = remove_profile(&out, PROFILE_TITLE);
    insert_profile(&out, overrides)
}

fn insert_profile(xml: &str, overrides: &LosslessOverrides) -> String {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut inserted = false;
    let mut depth = 0usize;

    loop {
        let event = match reader.read_event() {
            Ok(Event::Eof) => break,
            Ok(event) => event,
            Err(_) => return xml.to_string(),
        };
        match event {
            Event::Start(e) => {
                depth += 1;
                if writer.write_event(Event::Start(e)).is_err() {
                    return xml.to_string();
                }
            }
            Event::End(e) => {
                depth = depth.saturating_sub(1);
                if !inserted && e.name().as_ref() == b"Profiles" {
                    inserted = true;
                    write_profile_events(&mut writer, overrides);
                } else if depth == 0 && !inserted {
                    // No Profiles container yet
                    inserted = true;
                    let _ = writer.write_event(Event::Start(BytesStart::new("Profiles")));
                    write_profile_events(&mut writer, overrides);
                    let _ = writer.write_event(Event::End(BytesEnd::new("Profiles")));
                }
                if writer.write_event(Event::End(e)).is_err() {
                    return xml.to_string();
                }
            }
            other => {
                if writer.write_event(other).is_err() {
                    return xml.to_string();
                }
            }
        }
    }

    String::from_utf8(writer.into_inner().into_inner()).unwrap_or_else(|_| xml.to_string())
}

fn write_profile_events(writer: &mut Writer<Cursor<Vec<u8>>>, overrides: &LosslessOverrides) {
    let scaling_type = serde_json::to_value(overrides.scaling_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "off".to_string());

    let mut fields: Vec<(&str, String)> = vec![
        ("Title", PROFILE_TITLE.to_string()),
        (
            "PerformanceMode",
            if overrides.performance_mode { "True" } else { "False" }.to_string(),
        ),
        ("ScalingType", scaling_type),
        (
            "Anime4kVRS",
            if overrides.anime4k_vrs { "True" } else { "False" }.to_string(),
        ),
    ];
    if let Some(v) = overrides.flow_scale {
        fields.push(("FlowScale", v.to_string()));
    }
    if let Some(v) = overrides.resolution_scale {
        fields.push(("ResolutionScale", v.to_string()));
    }
    if let Some(v) = overrides.sharpening {
        fields.push(("Sharpening", v.to_string()));
    }
    if !overrides.anime4k_size.is_empty() {
        fields.push(("Anime4kSize", overrides.anime4k_size.clone()));
    }

    let _ = writer.write_event(Event::Start(BytesStart::new("Profile")));
    for (tag, value) in fields {
        let _ = writer.write_event(Event::Start(BytesStart::new(tag)));
        let _ = writer.write_event(Event::Text(BytesText::new(&value)));
        let _ = writer.write_event(Event::End(BytesEnd::new(tag)));
    }
    let _ = writer.write_event(Event::End(BytesEnd::new("Profile")));
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "<Settings>\
        <AutoScale>False</AutoScale>\
        <AutoScaleDelay>5</AutoScaleDelay>\
        <LSFG3Target>60</LSFG3Target>\
        <Unrelated>keep-me</Unrelated>\
        <Profiles>\
            <Profile><Title>Default</Title><ScalingType>off</ScalingType></Profile>\
        </Profiles>\
    </Settings>";

    #[test]
    fn read_and_write_settings() {
        assert_eq!(read_setting(SAMPLE, "AutoScale").as_deref(), Some("False"));
        assert_eq!(read_setting(SAMPLE, "Missing"), None);

        let out = write_setting(SAMPLE, "AutoScale", "True");
        assert_eq!(read_setting(&out, "AutoScale").as_deref(), Some("True"));
        // Untouched content survives
        assert_eq!(read_setting(&out, "Unrelated").as_deref(), Some("keep-me"));
    }

    #[test]
    fn write_creates_missing_elements() {
        let out = write_setting("<Settings></Settings>", "LSFG3Target", "120");
        assert_eq!(read_setting(&out, "LSFG3Target").as_deref(), Some("120"));
    }

    #[test]
    fn apply_and_restore_round_trip() {
        let backup = ProfileBackup::capture(SAMPLE);
        assert_eq!(backup.auto_scale.as_deref(), Some("False"));
        assert_eq!(backup.lsfg3_target.as_deref(), Some("60"));

        let overrides = LosslessOverrides {
            flow_scale: Some(75),
            resolution_scale: Some(50),
            sharpening: Some(5),
            ..Default::default()
        };
        let applied = apply_vibeshine_profile(SAMPLE, &overrides, Some(120));
        assert_eq!(read_setting(&applied, "AutoScale").as_deref(), Some("True"));
        assert_eq!(read_setting(&applied, "LSFG3Target").as_deref(), Some("120"));
        assert!(applied.contains("<Title>Vibeshine</Title>"));
        assert!(applied.contains("<FlowScale>75</FlowScale>"));
        // The user's own profile is untouched
        assert!(applied.contains("<Title>Default</Title>"));

        let restored = backup.restore(&applied);
        assert_eq!(read_setting(&restored, "AutoScale").as_deref(), Some("False"));
        assert_eq!(read_setting(&restored, "LSFG3Target").as_deref(), Some("60"));
        assert!(!restored.contains("Vibeshine"));
        assert!(restored.contains("<Title>Default</Title>"));
    }

    #[test]
    fn reapplying_does_not_duplicate_the_profile() {
        let overrides = LosslessOverrides::default();
        let once = apply_vibeshine_profile(SAMPLE, &overrides, None);
        let twice = apply_vibeshine_profile(&once, &overrides, None);
        assert_eq!(twice.matches("<Title>Vibeshine</Title>").count(), 1);
    }

    #[test]
    fn profile_inserted_even_without_profiles_container() {
        let out = apply_vibeshine_profile(
            "<Settings></Settings>",
            &LosslessOverrides::default(),
            None,
        );
        assert!(out.contains("<Profiles>"));
        assert!(out.contains("<Title>Vibeshine</Title>"));
    }
}
